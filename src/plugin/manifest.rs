//! Extension manifest
//!
//! The manifest is validated as raw JSON before it is deserialized. That way a
//! malformed document produces one error per failing field instead of a single
//! serde message, and unknown capability names or kinds are reported rather than
//! silently dropped.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::capability::Capability;
use super::sandbox::Permission;
use super::types::StreamFormat;
use crate::core::error::{ExtensionError, Result};

lazy_static! {
    static ref ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
    static ref VERSION_PATTERN: Regex = Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?$"
    )
    .unwrap();
    static ref INTEGRITY_PATTERN: Regex = Regex::new(r"^sha256-[0-9a-fA-F]{64}$").unwrap();
}

/// Maximum identifier length
pub const MAX_ID_LEN: usize = 64;

const REQUIRED_FIELDS: [&str; 6] = ["id", "name", "version", "kind", "targetVersion", "capabilities"];

/// What an extension is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionKind {
    /// Catalogue: search, listings, episodes, details
    MediaProvider,
    /// Hoster: turns an embed page into a playable stream
    StreamProvider,
    /// Both of the above
    Hybrid,
}

impl ExtensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::MediaProvider => "media-provider",
            ExtensionKind::StreamProvider => "stream-provider",
            ExtensionKind::Hybrid => "hybrid",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "media-provider" => Some(ExtensionKind::MediaProvider),
            "stream-provider" => Some(ExtensionKind::StreamProvider),
            "hybrid" => Some(ExtensionKind::Hybrid),
            _ => None,
        }
    }

    /// Whether instances of this kind take part in stream resolution
    pub fn resolves_streams(&self) -> bool {
        matches!(self, ExtensionKind::StreamProvider | ExtensionKind::Hybrid)
    }
}

impl std::fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platforms an extension declares support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    Universal,
    Desktop,
    Mobile,
    Windows,
    Macos,
    Linux,
    Ios,
    Android,
}

impl TargetPlatform {
    /// Platform the host is running on
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => TargetPlatform::Windows,
            "macos" => TargetPlatform::Macos,
            "ios" => TargetPlatform::Ios,
            "android" => TargetPlatform::Android,
            _ => TargetPlatform::Linux,
        }
    }

    /// Whether a declared platform covers `host`
    pub fn covers(&self, host: TargetPlatform) -> bool {
        match self {
            TargetPlatform::Universal => true,
            TargetPlatform::Desktop => matches!(
                host,
                TargetPlatform::Windows | TargetPlatform::Macos | TargetPlatform::Linux
            ),
            TargetPlatform::Mobile => matches!(host, TargetPlatform::Ios | TargetPlatform::Android),
            other => *other == host,
        }
    }

    /// Key used in native library locator maps
    pub fn library_key(&self) -> &'static str {
        match self {
            TargetPlatform::Windows => "windows",
            TargetPlatform::Macos => "macos",
            TargetPlatform::Ios => "ios",
            TargetPlatform::Android => "android",
            TargetPlatform::Universal => "universal",
            TargetPlatform::Desktop => "desktop",
            TargetPlatform::Mobile => "mobile",
            TargetPlatform::Linux => "linux",
        }
    }
}

/// Where the executable part of an extension lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Locator {
    /// Script source, relative to the extension directory
    Script { path: String },
    /// Linear-memory binary module
    Module { path: String },
    /// Shared library per platform (`linux`, `macos`, `windows`, ...)
    Native { libraries: BTreeMap<String, String> },
    /// Compiled into the host
    Builtin,
}

/// Network and integrity constraints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,
    /// `sha256-<hex>` digest of the executable artifact
    #[serde(default)]
    pub integrity_hash: Option<String>,
}

/// Extension manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: ExtensionKind,
    pub target_version: String,
    #[serde(default)]
    pub max_version: Option<String>,
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub security: Option<SecurityPolicy>,
    #[serde(default)]
    pub locator: Option<Locator>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    /// Hoster names a stream provider handles
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<TargetPlatform>,
    /// Minimum delay between outbound requests
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    /// Free-form configuration handed to the extension at init
    #[serde(default)]
    pub config: Value,
}

/// Outcome of manifest validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Collapse the blocking errors into a single `ValidationError`
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(ExtensionError::ValidationError(self.errors.join("; ")))
        }
    }
}

impl Manifest {
    /// Validate then deserialize a JSON manifest
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json).map_err(|e| {
            ExtensionError::ValidationError(format!("manifest is not valid JSON: {}", e))
        })?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self> {
        validate(&raw).into_result()?;
        serde_json::from_value(raw).map_err(|e| {
            ExtensionError::ValidationError(format!("manifest has a malformed field: {}", e))
        })
    }

    /// Advertised capabilities, in registry order
    pub fn advertised(&self) -> BTreeSet<Capability> {
        self.capabilities
            .iter()
            .filter(|(_, enabled)| **enabled)
            .filter_map(|(name, _)| Capability::from_name(name))
            .collect()
    }

    pub fn advertises(&self, capability: Capability) -> bool {
        self.capabilities
            .get(capability.as_str())
            .copied()
            .unwrap_or(false)
    }

    pub fn permissions(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .filter_map(|p| Permission::from_name(p))
            .collect()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn allowed_domains(&self) -> Option<&[String]> {
        self.security
            .as_ref()
            .and_then(|s| s.allowed_domains.as_deref())
    }

    pub fn integrity_hash(&self) -> Option<&str> {
        self.security
            .as_ref()
            .and_then(|s| s.integrity_hash.as_deref())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Check a raw manifest document.
///
/// Checks run in a fixed order: required fields, identifier, version grammar,
/// kind, capabilities, permissions. Later checks still run when earlier ones
/// fail so the caller sees every problem at once.
pub fn validate(raw: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => {
            return ValidationResult {
                valid: false,
                errors: vec!["manifest must be a JSON object".to_string()],
                warnings,
            }
        }
    };

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => errors.push(format!("missing required field '{}'", field)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                errors.push(format!("required field '{}' is empty", field))
            }
            _ => {}
        }
    }

    if let Some(id) = obj.get("id").and_then(Value::as_str) {
        if !ID_PATTERN.is_match(id) {
            errors.push(format!(
                "field 'id' must match [A-Za-z0-9_-] with length 1..={}, got '{}'",
                MAX_ID_LEN, id
            ));
        }
    } else if obj.contains_key("id") {
        errors.push("field 'id' must be a string".to_string());
    }

    check_version_field(obj.get("version"), "version", &mut errors);
    check_version_field(obj.get("targetVersion"), "targetVersion", &mut errors);
    if obj.contains_key("maxVersion") && !obj["maxVersion"].is_null() {
        check_version_field(obj.get("maxVersion"), "maxVersion", &mut errors);
        if let (Some(target), Some(max)) = (
            parse_version(obj.get("targetVersion")),
            parse_version(obj.get("maxVersion")),
        ) {
            if max < target {
                errors.push(format!(
                    "field 'maxVersion' ({}) is lower than 'targetVersion' ({})",
                    max, target
                ));
            }
        }
    }

    let kind = match obj.get("kind") {
        Some(Value::String(kind)) => match ExtensionKind::from_name(kind) {
            Some(kind) => Some(kind),
            None => {
                errors.push(format!(
                    "field 'kind' has unknown value '{}' (expected media-provider, stream-provider or hybrid)",
                    kind
                ));
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(_) => {
            errors.push("field 'kind' must be a string".to_string());
            None
        }
    };

    let mut enabled = BTreeSet::new();
    match obj.get("capabilities") {
        Some(Value::Object(caps)) => {
            for (name, flag) in caps {
                match Capability::from_name(name) {
                    None => errors.push(format!("field 'capabilities' has unknown capability '{}'", name)),
                    Some(capability) => match flag {
                        Value::Bool(true) => {
                            enabled.insert(capability);
                        }
                        Value::Bool(false) => {}
                        _ => errors.push(format!("capability flag '{}' must be a boolean", name)),
                    },
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => errors.push("field 'capabilities' must be an object of boolean flags".to_string()),
    }

    match obj.get("permissions") {
        Some(Value::Array(perms)) => {
            for perm in perms {
                match perm.as_str() {
                    Some(name) if Permission::from_name(name).is_some() => {}
                    Some(name) => errors.push(format!("field 'permissions' has unknown permission '{}'", name)),
                    None => errors.push("field 'permissions' must contain only strings".to_string()),
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => errors.push("field 'permissions' must be an array".to_string()),
    }

    if let Some(security) = obj.get("security").and_then(Value::as_object) {
        if let Some(hash) = security.get("integrityHash").and_then(Value::as_str) {
            if !INTEGRITY_PATTERN.is_match(hash) {
                errors.push("field 'security.integrityHash' must be 'sha256-' followed by 64 hex digits".to_string());
            }
        }
    }

    if obj.get("icon").map_or(true, Value::is_null) {
        warnings.push("manifest has no icon".to_string());
    }
    if obj.get("description").map_or(true, Value::is_null) {
        warnings.push("manifest has no description".to_string());
    }
    if enabled.is_empty() && matches!(obj.get("capabilities"), Some(Value::Object(_))) {
        warnings.push("extension has no capabilities enabled".to_string());
    }
    if kind == Some(ExtensionKind::StreamProvider) && !enabled.contains(&Capability::ExtractStream) {
        warnings.push("stream-provider does not advertise extractStream".to_string());
    }
    if let Some(Value::Array(formats)) = obj.get("formats") {
        for format in formats.iter().filter_map(Value::as_str) {
            if StreamFormat::from_name(format).is_none() {
                warnings.push(format!("unknown stream format '{}'", format));
            }
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_version_field(value: Option<&Value>, field: &str, errors: &mut Vec<String>) {
    match value {
        Some(Value::String(v)) if !v.trim().is_empty() => {
            if !VERSION_PATTERN.is_match(v) {
                errors.push(format!(
                    "field '{}' must be MAJOR.MINOR.PATCH[-prerelease], got '{}'",
                    field, v
                ));
            }
        }
        Some(Value::Null) | None | Some(Value::String(_)) => {}
        Some(_) => errors.push(format!("field '{}' must be a string", field)),
    }
}

fn parse_version(value: Option<&Value>) -> Option<semver::Version> {
    value
        .and_then(Value::as_str)
        .and_then(|v| semver::Version::parse(v).ok())
}
