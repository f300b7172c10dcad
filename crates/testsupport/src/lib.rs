pub mod fixtures;
pub mod index_server;

pub use fixtures::*;
pub use index_server::*;
