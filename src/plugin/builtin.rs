//! Built-in hoster extension
//!
//! A Rust-native stream provider that resolves hoster embed URLs with the
//! extraction pipelines. Page fetches go through the instance's host surface,
//! so the allowlist and rate limiter apply exactly as for any other extension.

use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

use super::capability::Capability;
use super::host::{HostSurface, HttpRequest};
use super::manifest::Manifest;
use super::types::{BackendType, PluginBackend, StreamDescriptor};
use super::version::HOST_VERSION;
use crate::core::error::{ExtensionError, Result};
use crate::extract::hosters::{finish_challenge, js_redirect_target};
use crate::extract::{find_hoster, hoster_infos, Extraction, HosterDescriptor, HOSTERS};

pub const BUILTIN_ID: &str = "builtin-hosters";

/// Manifest of the built-in extension; its allowlist is the hoster table
pub fn builtin_manifest() -> Result<Manifest> {
    let domains: Vec<String> = HOSTERS
        .iter()
        .flat_map(|h| h.domains.iter())
        .flat_map(|d| [d.to_string(), format!("*.{}", d)])
        .collect();
    let providers: Vec<&str> = HOSTERS.iter().map(|h| h.name).collect();

    Manifest::from_value(json!({
        "id": BUILTIN_ID,
        "name": "Built-in Hosters",
        "version": HOST_VERSION,
        "kind": "stream-provider",
        "targetVersion": HOST_VERSION,
        "description": "Stream extraction for common video hosters",
        "author": "extension-host",
        "capabilities": { "extractStream": true, "getHosterInfo": true },
        "permissions": ["network", "logging"],
        "security": { "allowedDomains": domains },
        "locator": { "type": "builtin" },
        "providers": providers,
        "formats": ["hls", "mp4"]
    }))
}

/// `PluginBackend` for the built-in hoster table
#[derive(Default)]
pub struct BuiltinHosterBackend {
    surface: RwLock<Option<Arc<HostSurface>>>,
}

impl BuiltinHosterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn surface(&self) -> Result<Arc<HostSurface>> {
        self.surface
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| ExtensionError::InvalidState("builtin extension is not initialized".to_string()))
    }

    async fn fetch_page(surface: &HostSurface, url: &str, referer: Option<&str>) -> Result<(String, String)> {
        let mut request = HttpRequest::get(url);
        if let Some(referer) = referer {
            request = request.with_header("Referer", referer);
        }
        let response = surface.fetch(request).await?;
        if !response.is_success() {
            return Err(ExtensionError::NetworkError(format!(
                "{} answered with status {}",
                url, response.status
            )));
        }
        Ok((response.url, response.body))
    }

    /// Resolve one embed URL; `None` when the page yields no stream
    pub async fn resolve(&self, url: &str) -> Result<Option<StreamDescriptor>> {
        let hoster = match find_hoster(url) {
            Some(hoster) => hoster,
            None => return Ok(None),
        };
        let surface = self.surface()?;

        let (final_url, body) = Self::fetch_page(&surface, url, None).await?;
        let mut chain = vec![url.to_string()];
        if final_url != url {
            chain.push(final_url);
        }

        let mut extraction = hoster.pipeline.run(&body, &chain);

        if extraction == Extraction::NotFound {
            if let Some(target) = js_redirect_target(&body).and_then(|t| join_url(chain.last()?, &t)) {
                surface.logger().debug(&format!("{} redirects to {}", hoster.name, target));
                let (final_url, body) = Self::fetch_page(&surface, &target, chain.last().map(String::as_str)).await?;
                chain.push(final_url);
                extraction = hoster.pipeline.run(&body, &chain);
            }
        }

        match extraction {
            Extraction::Stream(stream) => Ok(Some(stream)),
            Extraction::Challenge(challenge) => {
                let (_, prefix) = Self::fetch_page(&surface, &challenge.pass_url, Some(&challenge.referer)).await?;
                Ok(finish_challenge(&challenge, &prefix))
            }
            Extraction::NotFound => {
                surface.logger().debug(&format!("{} page yielded no stream", hoster.name));
                Ok(None)
            }
        }
    }

    fn hoster_for_args(args: &Value) -> Option<&'static HosterDescriptor> {
        args.get("url").and_then(Value::as_str).and_then(find_hoster)
    }
}

fn join_url(base: &str, target: &str) -> Option<String> {
    url::Url::parse(base).ok()?.join(target).ok().map(|u| u.to_string())
}

#[async_trait::async_trait]
impl PluginBackend for BuiltinHosterBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Builtin
    }

    async fn initialize(&self, surface: Arc<HostSurface>) -> Result<()> {
        *self.surface.write().unwrap_or_else(|p| p.into_inner()) = Some(surface);
        Ok(())
    }

    async fn invoke(&self, capability: Capability, args: Value) -> Result<Value> {
        match capability {
            Capability::ExtractStream => {
                let url = args
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExtensionError::ValidationError("extractStream requires 'url'".to_string()))?;
                let stream = self.resolve(url).await?;
                Ok(serde_json::to_value(stream)?)
            }
            Capability::GetHosterInfo => Ok(serde_json::to_value(hoster_infos())?),
            other => Err(ExtensionError::ExecutionError(format!(
                "builtin extension does not implement {}",
                other
            ))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        *self.surface.write().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }

    fn is_cacheable(&self, capability: Capability, args: &Value) -> bool {
        match capability {
            Capability::ExtractStream => Self::hoster_for_args(args)
                .map(|h| h.pipeline.is_idempotent())
                .unwrap_or(true),
            _ => true,
        }
    }
}
