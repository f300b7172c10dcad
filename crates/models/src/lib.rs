pub mod config;
pub mod environment;
pub mod error;
pub mod image;
pub mod state;

pub use config::*;
pub use environment::*;
pub use error::*;
pub use image::*;
pub use state::*;
