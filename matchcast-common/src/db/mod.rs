//! Database initialization and the record store

pub mod init;
pub mod records;

pub use init::*;
pub use records::*;
