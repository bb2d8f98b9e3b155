//! Database access layer

pub mod init;
pub mod migrations;

pub use init::{create_schema, init_database, init_memory_database};
pub use migrations::run_migrations;
