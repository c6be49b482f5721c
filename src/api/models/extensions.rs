use crate::core::error::{ExtensionError, Result};
use crate::plugin::{Capability, ExtensionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query of `GET /api/extensions`
#[derive(Debug, Default, Deserialize)]
pub struct ListExtensionsQuery {
    pub capability: Option<String>,
    pub kind: Option<String>,
}

impl ListExtensionsQuery {
    pub fn capability(&self) -> Result<Option<Capability>> {
        self.capability
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(str::parse)
            .transpose()
    }

    pub fn kind(&self) -> Result<Option<ExtensionKind>> {
        match self.kind.as_deref().filter(|k| !k.is_empty()) {
            None => Ok(None),
            Some(name) => ExtensionKind::from_name(name)
                .map(Some)
                .ok_or_else(|| ExtensionError::ValidationError(format!("unknown extension kind '{}'", name))),
        }
    }
}

/// Body of `POST /api/extensions`
#[derive(Debug, Deserialize)]
pub struct LoadExtensionRequest {
    /// Manifest object, or the manifest document as a string
    pub manifest: Value,
    /// Script body, module path or native library directory
    #[serde(default)]
    pub source: String,
}

impl LoadExtensionRequest {
    pub fn manifest_json(&self) -> Result<String> {
        match &self.manifest {
            Value::String(raw) => Ok(raw.clone()),
            Value::Object(_) => Ok(serde_json::to_string(&self.manifest)?),
            _ => Err(ExtensionError::ValidationError(
                "field 'manifest' must be an object or a JSON string".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveStreamRequest {
    pub url: String,
}

/// Body of a successful `invoke` call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub extension_id: String,
    pub capability: Capability,
    pub result: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadResponse {
    pub id: String,
    pub unloaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_parsing() {
        let query = ListExtensionsQuery {
            capability: Some("extractStream".to_string()),
            kind: Some("stream-provider".to_string()),
        };
        assert_eq!(query.capability().unwrap(), Some(Capability::ExtractStream));
        assert_eq!(query.kind().unwrap(), Some(ExtensionKind::StreamProvider));

        let empty = ListExtensionsQuery::default();
        assert_eq!(empty.capability().unwrap(), None);
        assert_eq!(empty.kind().unwrap(), None);

        let bad = ListExtensionsQuery {
            capability: Some("teleport".to_string()),
            kind: Some("widget".to_string()),
        };
        assert!(matches!(bad.capability(), Err(ExtensionError::ValidationError(_))));
        assert!(matches!(bad.kind(), Err(ExtensionError::ValidationError(_))));
    }

    #[test]
    fn test_manifest_as_object_or_string() {
        let object: LoadExtensionRequest =
            serde_json::from_value(json!({ "manifest": { "id": "alpha" } })).unwrap();
        assert_eq!(object.manifest_json().unwrap(), r#"{"id":"alpha"}"#);
        assert_eq!(object.source, "");

        let string: LoadExtensionRequest =
            serde_json::from_value(json!({ "manifest": "{\"id\":\"alpha\"}", "source": "x" })).unwrap();
        assert_eq!(string.manifest_json().unwrap(), r#"{"id":"alpha"}"#);

        let invalid: LoadExtensionRequest = serde_json::from_value(json!({ "manifest": 3 })).unwrap();
        assert!(invalid.manifest_json().is_err());
    }
}
