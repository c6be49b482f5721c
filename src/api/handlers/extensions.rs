use super::AppState;
use crate::api::models::{
    InvokeResponse, ListExtensionsQuery, LoadExtensionRequest, ResolveStreamRequest, SetEnabledRequest,
    UnloadResponse,
};
use crate::core::error::Result;
use crate::plugin::Capability;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::info;

/// Handler for GET /api/extensions
pub async fn list_extensions(
    State(state): State<AppState>,
    Query(query): Query<ListExtensionsQuery>,
) -> Result<impl IntoResponse> {
    let capability = query.capability()?;
    let kind = query.kind()?;

    let extensions = match (capability, kind) {
        (Some(capability), kind) => {
            let mut selected = state.manager.list_by_capability(capability).await;
            if let Some(kind) = kind {
                selected.retain(|s| s.kind == kind);
            }
            selected
        }
        (None, Some(kind)) => state.manager.list_by_kind(kind).await,
        (None, None) => state.manager.list().await,
    };

    Ok(Json(extensions))
}

/// Handler for POST /api/extensions
pub async fn load_extension(
    State(state): State<AppState>,
    Json(req): Json<LoadExtensionRequest>,
) -> Result<impl IntoResponse> {
    let manifest_json = req.manifest_json()?;
    let summary = state.manager.load_manifest_json(&manifest_json, &req.source).await?;
    info!(extension_id = %summary.id, version = %summary.version, "Extension loaded via API");
    Ok((StatusCode::CREATED, Json(summary)))
}

/// Handler for GET /api/extensions/:id
pub async fn get_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.summary(&id).await?))
}

/// Handler for DELETE /api/extensions/:id
pub async fn unload_extension(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.manager.unload(&id).await?;
    Ok(Json(UnloadResponse { id, unloaded: true }))
}

/// Handler for PUT /api/extensions/:id/enabled
pub async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.set_enabled(&id, req.enabled).await?))
}

/// Handler for GET /api/extensions/:id/compatibility
pub async fn check_compatibility(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.check_compatibility(&id).await?))
}

/// Handler for POST /api/extensions/:id/invoke/:capability
///
/// The body is the argument object; an absent body means no arguments.
pub async fn invoke_capability(
    State(state): State<AppState>,
    Path((id, capability)): Path<(String, String)>,
    args: Option<Json<Value>>,
) -> Result<impl IntoResponse> {
    let capability: Capability = capability.parse()?;
    let args = args.map(|Json(v)| v).unwrap_or_else(|| Value::Object(Default::default()));

    let result = state.manager.invoke(&id, capability, args).await?;
    Ok(Json(InvokeResponse {
        extension_id: id,
        capability,
        result,
    }))
}

/// Handler for POST /api/manifests/validate
pub async fn validate_manifest(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.validate_manifest(&raw)))
}

/// Handler for POST /api/streams/resolve
pub async fn resolve_stream(
    State(state): State<AppState>,
    Json(req): Json<ResolveStreamRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.manager.resolve_stream(&req.url).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::handlers::AppState;
    use crate::api::routes::build_api_routes;
    use crate::core::config::{CacheConfig, ExtensionsConfig};
    use crate::plugin::{ExtensionManager, MemoryKvStore, BUILTIN_ID};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn app() -> Router {
        let manager = ExtensionManager::new(
            ExtensionsConfig {
                extension_dir: PathBuf::from("extensions"),
                profile: "default".to_string(),
                default_rate_limit_ms: 0,
                call_timeout_secs: 5,
                max_wasm_memory_bytes: 16 * 1024 * 1024,
                storage_quota_bytes: 1024 * 1024,
                load_builtin: true,
            },
            &CacheConfig {
                stream_ttl_secs: 600,
                listing_ttl_secs: 3600,
                hoster_info_ttl_secs: 86400,
            },
            Arc::new(MemoryKvStore::new()),
            None,
        )
        .unwrap();
        manager.register_builtin().await.unwrap();
        build_api_routes(AppState::new(Arc::new(manager)))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["hostVersion"], crate::plugin::HOST_VERSION);
        assert_eq!(body["extensions"], 1);
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let app = app().await;

        let (status, body) = call(&app, Method::GET, "/api/extensions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], BUILTIN_ID);

        let (_, body) = call(&app, Method::GET, "/api/extensions?capability=extractStream", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(&app, Method::GET, "/api/extensions?kind=media-provider", None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (_, body) = call(
            &app,
            Method::GET,
            "/api/extensions?capability=extractStream&kind=media-provider",
            None,
        )
        .await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, body) = call(&app, Method::GET, "/api/extensions?capability=teleport", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
    }

    #[tokio::test]
    async fn test_get_and_unload() {
        let app = app().await;
        let uri = format!("/api/extensions/{}", BUILTIN_ID);

        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "ready");

        let (status, body) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unloaded"], true);

        let (status, _) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invoke() {
        let app = app().await;

        let uri = format!("/api/extensions/{}/invoke/getHosterInfo", BUILTIN_ID);
        let (status, body) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["capability"], "getHosterInfo");
        assert!(!body["result"].as_array().unwrap().is_empty());

        let uri = format!("/api/extensions/{}/invoke/search", BUILTIN_ID);
        let (status, body) = call(&app, Method::POST, &uri, Some(json!({ "query": "x" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "PermissionDenied");

        let uri = format!("/api/extensions/{}/invoke/teleport", BUILTIN_ID);
        let (status, _) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::POST, "/api/extensions/missing/invoke/search", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disabled_extension_refuses_calls() {
        let app = app().await;

        let uri = format!("/api/extensions/{}/enabled", BUILTIN_ID);
        let (status, body) = call(&app, Method::PUT, &uri, Some(json!({ "enabled": false }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);

        let uri = format!("/api/extensions/{}/invoke/getHosterInfo", BUILTIN_ID);
        let (status, _) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_compatibility() {
        let app = app().await;
        let uri = format!("/api/extensions/{}/compatibility", BUILTIN_ID);
        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "compatible");
        assert_eq!(body["platformCompatible"], true);
    }

    #[tokio::test]
    async fn test_load_rejections() {
        let app = app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/extensions",
            Some(json!({ "manifest": { "id": "broken" }, "source": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");

        let manifest = json!({
            "id": "future",
            "name": "Future",
            "version": "1.0.0",
            "kind": "media-provider",
            "targetVersion": "99.0.0",
            "capabilities": { "search": true },
            "permissions": [],
            "locator": { "type": "script", "path": "index.js" }
        });
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/extensions",
            Some(json!({ "manifest": manifest, "source": "exports.search = () => null;" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "CompatibilityError");
    }

    #[tokio::test]
    async fn test_validate_manifest() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/manifests/validate",
            Some(json!({ "id": "alpha" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], false);
        assert!(!body["errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_hoster() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/streams/resolve",
            Some(json!({ "url": "https://unknown.invalid/e/1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }
}
