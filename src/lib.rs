//! Extension Host Library
//!
//! Loads third-party media and stream provider extensions (script, WASM
//! module, native library and built-in backends), dispatches capability calls
//! through a coalescing cache and serves a JSON control API.

pub mod api;
pub mod cache;
pub mod core;
pub mod db;
pub mod extract;
pub mod plugin;

// Re-export commonly used types
pub use api::ApiServer;
pub use crate::core::{Config, ExtensionError};
pub use db::DatabaseManager;
pub use plugin::ExtensionManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the binary edge
pub type Result<T> = anyhow::Result<T>;
