// Core module - configuration, errors and logging shared by every layer
pub mod config;
pub mod error;
pub mod logging;

pub use config::{CliArgs, Config};
pub use error::{ErrorContext, ErrorResponse, ExtensionError, Result};
pub use logging::Logger;
