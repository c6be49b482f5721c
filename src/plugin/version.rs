//! Host/extension version compatibility
//!
//! An extension built against host major `N` runs on any host `N.y.z`.
//! `maxVersion` narrows the range further and the `platforms` list gates
//! by operating system.

use semver::Version;
use serde::{Deserialize, Serialize};

use super::manifest::{Manifest, TargetPlatform};
use crate::core::error::{ExtensionError, Result};

/// Version of the running host
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompatibilityStatus {
    Compatible,
    CompatibleWithWarning,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityReport {
    pub status: CompatibilityStatus,
    pub platform_compatible: bool,
    pub warnings: Vec<String>,
    pub target_version: String,
    pub max_version: Option<String>,
    pub host_version: String,
}

impl CompatibilityReport {
    pub fn is_loadable(&self) -> bool {
        self.status != CompatibilityStatus::Incompatible && self.platform_compatible
    }

    /// Turn a refusal into a `CompatibilityError` naming both versions
    pub fn into_result(self) -> Result<Self> {
        if self.is_loadable() {
            return Ok(self);
        }
        let reason = if self.warnings.is_empty() {
            "incompatible".to_string()
        } else {
            self.warnings.join("; ")
        };
        Err(ExtensionError::CompatibilityError(format!(
            "extension targets host {} but host is {}: {}",
            self.target_version, self.host_version, reason
        )))
    }
}

/// Compare a target range against a host version
pub fn check_versions(target: &str, max: Option<&str>, host: &str) -> Result<CompatibilityReport> {
    let parse = |field: &str, v: &str| {
        Version::parse(v).map_err(|e| {
            ExtensionError::ValidationError(format!("field '{}' is not a valid version '{}': {}", field, v, e))
        })
    };
    let target_v = parse("targetVersion", target)?;
    let host_v = parse("hostVersion", host)?;
    let max_v = max.map(|m| parse("maxVersion", m)).transpose()?;

    let mut warnings = Vec::new();
    let status = if host_v.major != target_v.major {
        warnings.push(format!(
            "major version mismatch: extension targets {}.x, host is {}",
            target_v.major, host_v
        ));
        CompatibilityStatus::Incompatible
    } else if let Some(max_v) = max_v.as_ref().filter(|max_v| host_v > **max_v) {
        warnings.push(format!("host {} is newer than supported maximum {}", host_v, max_v));
        CompatibilityStatus::Incompatible
    } else if cmp_release(&host_v, &target_v) == std::cmp::Ordering::Greater {
        warnings.push(format!("host {} is newer than targeted {}", host_v, target_v));
        CompatibilityStatus::CompatibleWithWarning
    } else if cmp_release(&host_v, &target_v) == std::cmp::Ordering::Less {
        warnings.push(format!(
            "host {} is older than targeted {}; newer host features may be missing",
            host_v, target_v
        ));
        CompatibilityStatus::CompatibleWithWarning
    } else {
        CompatibilityStatus::Compatible
    };

    Ok(CompatibilityReport {
        status,
        platform_compatible: true,
        warnings,
        target_version: target.to_string(),
        max_version: max.map(str::to_string),
        host_version: host.to_string(),
    })
}

/// Full check for a manifest, including the platform list
pub fn check_manifest(manifest: &Manifest, host: &str, platform: TargetPlatform) -> Result<CompatibilityReport> {
    let mut report = check_versions(&manifest.target_version, manifest.max_version.as_deref(), host)?;

    if !manifest.platforms.is_empty() && !manifest.platforms.iter().any(|p| p.covers(platform)) {
        report.platform_compatible = false;
        report
            .warnings
            .push(format!("platform {} is not in the supported platform list", platform.library_key()));
    }

    Ok(report)
}

// Pre-release tags do not make a host "newer" or "older" for compatibility
fn cmp_release(a: &Version, b: &Version) -> std::cmp::Ordering {
    (a.major, a.minor, a.patch).cmp(&(b.major, b.minor, b.patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_same_version_is_compatible() {
        let report = check_versions("2.5.0", None, "2.5.0").unwrap();
        assert_eq!(report.status, CompatibilityStatus::Compatible);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_newer_host_warns() {
        let report = check_versions("2.5.0", None, "2.7.1").unwrap();
        assert_eq!(report.status, CompatibilityStatus::CompatibleWithWarning);
        assert!(report.is_loadable());
    }

    #[test]
    fn test_major_mismatch_refused() {
        let err = check_versions("1.0.0", None, "2.0.0")
            .unwrap()
            .into_result()
            .unwrap_err();
        match err {
            ExtensionError::CompatibilityError(msg) => {
                assert!(msg.contains("1.0.0"));
                assert!(msg.contains("2.0.0"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_max_version_narrows() {
        let report = check_versions("2.0.0", Some("2.3.0"), "2.4.0").unwrap();
        assert_eq!(report.status, CompatibilityStatus::Incompatible);

        let report = check_versions("2.0.0", Some("2.3.0"), "2.3.0").unwrap();
        assert!(report.is_loadable());
    }

    #[test]
    fn test_prerelease_host_counts_as_release() {
        let report = check_versions("2.5.0", None, "2.5.0-beta.2").unwrap();
        assert_eq!(report.status, CompatibilityStatus::Compatible);
    }

    #[test]
    fn test_invalid_version_is_validation_error() {
        assert!(matches!(
            check_versions("two", None, "2.0.0"),
            Err(ExtensionError::ValidationError(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_differing_majors_incompatible(
            host_major in 0u64..50, target_major in 0u64..50,
            minor in 0u64..20, patch in 0u64..20,
        ) {
            prop_assume!(host_major != target_major);
            let report = check_versions(
                &format!("{}.{}.{}", target_major, minor, patch),
                None,
                &format!("{}.{}.{}", host_major, patch, minor),
            ).unwrap();
            prop_assert_eq!(report.status, CompatibilityStatus::Incompatible);
        }
    }
}
