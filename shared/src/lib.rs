pub mod database;
pub mod models;
pub mod config;
pub mod entity;

pub use database::{get_db_connection, get_memory_connection};
pub use config::Config;
pub use models::*;
