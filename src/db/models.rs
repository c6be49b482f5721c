//! Database models

use serde::{Deserialize, Serialize};

/// Persisted extension entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub profile: String,
    pub id: String,
    /// Manifest JSON as loaded
    pub manifest: String,
    /// Script body, or the path of the artifact for module/native extensions
    pub source: String,
    pub enabled: bool,
    pub installed_at: String,
}

