pub mod cli;
pub mod config;

pub use cli::{run_cli, Cli};
pub use config::load_config;
