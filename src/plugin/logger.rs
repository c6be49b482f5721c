use tracing::{debug, error, info, warn};

use crate::core::logging::EXTENSION_TARGET;

/// Log sink handed to extensions; every record carries the extension id
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    extension_id: String,
}

impl ExtensionLogger {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
        }
    }

    pub fn debug(&self, message: &str) {
        debug!(target: EXTENSION_TARGET, extension = %self.extension_id, "{}", message);
    }

    pub fn info(&self, message: &str) {
        info!(target: EXTENSION_TARGET, extension = %self.extension_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(target: EXTENSION_TARGET, extension = %self.extension_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(target: EXTENSION_TARGET, extension = %self.extension_id, "{}", message);
    }

    /// Log at a level named by the extension; unknown names log at info
    pub fn log(&self, level: &str, message: &str) {
        match level.to_ascii_lowercase().as_str() {
            "debug" | "trace" => self.debug(message),
            "warn" | "warning" => self.warn(message),
            "error" => self.error(message),
            _ => self.info(message),
        }
    }
}
