//! Security sandbox implementation
//!
//! This module provides security isolation for extensions through:
//! - Permission-based access control
//! - A per-instance network domain allowlist checked before any request
//! - Resource limits applied by the module and script runtimes

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::{ExtensionError, Result};

/// Permissions an extension may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Outbound HTTP through the host
    Network,
    /// Namespaced key-value storage
    Storage,
    /// Host log sink
    Logging,
    /// Timers and sleeps
    Timers,
    /// Hashing and encoding helpers
    Crypto,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Network,
        Permission::Storage,
        Permission::Logging,
        Permission::Timers,
        Permission::Crypto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Network => "network",
            Permission::Storage => "storage",
            Permission::Logging => "logging",
            Permission::Timers => "timers",
            Permission::Crypto => "crypto",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security sandbox for one extension instance
///
/// Network policy:
/// - without the `network` permission no request is ever made
/// - with it, only hosts matching the allowlist are reachable
/// - an absent or empty allowlist denies every host
/// - the single entry `*` opts into any host
#[derive(Debug, Clone)]
pub struct Sandbox {
    extension_id: String,
    permissions: Vec<Permission>,
    allowed_domains: Vec<String>,
    pub resource_limits: ResourceLimits,
}

impl Sandbox {
    pub fn new(
        extension_id: impl Into<String>,
        permissions: Vec<Permission>,
        allowed_domains: Option<Vec<String>>,
        resource_limits: ResourceLimits,
    ) -> Self {
        let allowed_domains = allowed_domains
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Self {
            extension_id: extension_id.into(),
            permissions,
            allowed_domains,
            resource_limits,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ExtensionError::PermissionDenied(format!(
                "extension '{}' did not declare the '{}' permission",
                self.extension_id, permission
            )))
        }
    }

    /// Check if network access to `url` is allowed
    pub fn check_network_access(&self, url: &str) -> Result<()> {
        self.require(Permission::Network)?;

        let host = Self::extract_host(url)?;

        let is_allowed = self
            .allowed_domains
            .iter()
            .any(|pattern| Self::domain_matches(&host, pattern));

        if !is_allowed {
            return Err(ExtensionError::PermissionDenied(format!(
                "extension '{}' may not access host '{}'",
                self.extension_id, host
            )));
        }

        Ok(())
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    fn extract_host(raw: &str) -> Result<String> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| ExtensionError::ValidationError(format!("invalid URL '{}': {}", raw, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ExtensionError::PermissionDenied(format!(
                    "scheme '{}' is not allowed",
                    other
                )))
            }
        }

        parsed
            .host_str()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .ok_or_else(|| ExtensionError::ValidationError(format!("URL '{}' has no host", raw)))
    }

    /// Exact match, `*` for any host, or `*.base` for `base` and its subdomains
    fn domain_matches(host: &str, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_prefix("*.") {
            Some(base) => {
                host == base
                    || (host.len() > base.len()
                        && host.ends_with(base)
                        && host.as_bytes()[host.len() - base.len() - 1] == b'.')
            }
            None => host == pattern,
        }
    }
}

/// Resource limits for extension execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes
    pub max_memory_bytes: usize,
    /// Maximum wall-clock time of a single call
    pub max_call_time: Duration,
}

impl ResourceLimits {
    pub fn new(max_memory_bytes: usize, max_call_time: Duration) -> Self {
        Self {
            max_memory_bytes,
            max_call_time,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            max_call_time: Duration::from_secs(30),
        }
    }
}
