pub mod extensions;
pub mod system;

pub use extensions::*;
pub use system::*;

use crate::plugin::ExtensionManager;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ExtensionManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<ExtensionManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}
