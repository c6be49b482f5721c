//! Database module
//!
//! SQLite persistence for the host:
//! - connection pool management
//! - schema migrations
//! - the installed-extension list and the extension key-value store

pub mod manager;
pub mod migrations;
pub mod models;
pub mod repository;

pub use manager::DatabaseManager;
pub use models::ExtensionRecord;
pub use repository::{ExtensionRepository, SqliteKvStore};
