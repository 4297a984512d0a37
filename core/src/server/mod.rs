//! Database front: connection handles, collection routing and shard fan-out

pub mod connection_manager;
pub mod database;

pub use connection_manager::ConnectionManager;
pub use database::Database;
