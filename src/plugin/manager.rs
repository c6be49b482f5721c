//! Extension manager
//!
//! Owns every loaded instance and is the single entry point for dispatch.
//! A load runs: validation, version check, integrity check, teardown of any
//! previous instance with the same id, adapter selection by locator, host
//! surface wiring, `initialize`, persistence. Calls are refused unless the
//! instance is `Ready`, enabled and advertises the capability; accepted calls
//! go through the extraction cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn, Instrument};

use super::builtin::{builtin_manifest, BuiltinHosterBackend};
use super::capability::{CacheTtls, Capability};
use super::host::{HostSurface, HttpContext};
use super::js_runtime::ScriptBackend;
use super::manifest::{self, ExtensionKind, Locator, Manifest, TargetPlatform, ValidationResult};
use super::native::{resolve_library, NativeBackend};
use super::package::{is_package_path, ExtensionPackage};
use super::runtime::ModuleBackend;
use super::sandbox::{ResourceLimits, Sandbox};
use super::storage::{ExtensionStorage, KvStore};
use super::types::{
    BackendType, EpisodesResult, ExtensionId, ExtensionStats, HosterInfo, InstanceState, MediaItem,
    PluginBackend, SearchResult, StreamDescriptor,
};
use super::version::{check_manifest, CompatibilityReport, HOST_VERSION};
use crate::cache::{CacheKey, CacheSource, CacheStats, ExtractionCache};
use crate::core::config::{CacheConfig, ExtensionsConfig};
use crate::core::error::{ExtensionError, Result};
use crate::core::logging::call_span;
use crate::db::{ExtensionRecord, ExtensionRepository};
use crate::extract::find_hoster;

/// Extra time the dispatcher allows on top of the per-call limit the
/// adapters enforce themselves
const DISPATCH_GRACE: Duration = Duration::from_secs(1);

/// Load counter; every instance gets its own cache generation
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Executable part of an extension, resolved from its locator
enum Artifact {
    Script(String),
    Module(Vec<u8>),
    /// Directory holding the platform libraries
    Native(PathBuf),
}

/// One loaded extension
pub struct ExtensionInstance {
    manifest: Manifest,
    backend: Arc<dyn PluginBackend>,
    surface: Arc<HostSurface>,
    /// Persisted source: script body, artifact path or package path
    source: String,
    generation: u64,
    state: AtomicU8,
    enabled: AtomicBool,
    loaded_at: chrono::DateTime<chrono::Utc>,
    compatibility: CompatibilityReport,
    stats: Mutex<ExtensionStats>,
}

impl ExtensionInstance {
    fn new(
        manifest: Manifest,
        backend: Arc<dyn PluginBackend>,
        surface: Arc<HostSurface>,
        source: String,
        enabled: bool,
        compatibility: CompatibilityReport,
    ) -> Self {
        Self {
            manifest,
            backend,
            surface,
            source,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(InstanceState::Unloaded.as_u8()),
            enabled: AtomicBool::new(enabled),
            loaded_at: chrono::Utc::now(),
            compatibility,
            stats: Mutex::new(ExtensionStats::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn surface(&self) -> &Arc<HostSurface> {
        &self.surface
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Ready and enabled
    pub fn is_dispatchable(&self) -> bool {
        self.state() == InstanceState::Ready && self.is_enabled()
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, ExtensionStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn summary(&self) -> InstanceSummary {
        let stats = self.stats().clone();
        InstanceSummary {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            kind: self.manifest.kind,
            state: self.state(),
            enabled: self.is_enabled(),
            backend: self.backend.backend_type(),
            capabilities: self.manifest.advertised().into_iter().collect(),
            permissions: self.manifest.permissions.clone(),
            description: self.manifest.description.clone(),
            icon: self.manifest.icon.clone(),
            providers: self.manifest.providers.clone(),
            source: source_label(self.backend.backend_type(), &self.source),
            loaded_at: self.loaded_at.to_rfc3339(),
            last_error: stats.last_error.clone(),
            warnings: self.compatibility.warnings.clone(),
            stats,
        }
    }
}

fn source_label(backend: BackendType, source: &str) -> String {
    match backend {
        BackendType::Script => "inline".to_string(),
        BackendType::Builtin => "builtin".to_string(),
        BackendType::Module | BackendType::Native => source.to_string(),
    }
}

/// Host-facing view of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: ExtensionKind,
    pub state: InstanceState,
    pub enabled: bool,
    pub backend: BackendType,
    pub capabilities: Vec<Capability>,
    pub permissions: Vec<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub providers: Vec<String>,
    pub source: String,
    pub loaded_at: String,
    pub last_error: Option<String>,
    pub warnings: Vec<String>,
    pub stats: ExtensionStats,
}

/// Stream found by fan-out resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResolution {
    pub extension_id: String,
    pub stream: StreamDescriptor,
}

/// Per-instance outcome of a fan-out search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub extension_id: String,
    pub result: Option<SearchResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub loaded: Vec<String>,
    pub failed: Vec<RestoreFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFailure {
    pub id: String,
    pub error: String,
}

/// Registry and dispatcher of extension instances
pub struct ExtensionManager {
    config: ExtensionsConfig,
    instances: Arc<RwLock<HashMap<ExtensionId, Arc<ExtensionInstance>>>>,
    /// Serializes load and unload so a reload never interleaves with another
    lifecycle: tokio::sync::Mutex<()>,
    cache: ExtractionCache,
    ttls: CacheTtls,
    limits: ResourceLimits,
    store: Arc<dyn KvStore>,
    repository: Option<ExtensionRepository>,
    client: reqwest::Client,
}

impl ExtensionManager {
    pub fn new(
        config: ExtensionsConfig,
        cache: &CacheConfig,
        store: Arc<dyn KvStore>,
        repository: Option<ExtensionRepository>,
    ) -> Result<Self> {
        let call_timeout = Duration::from_secs(config.call_timeout_secs);
        let client = HttpContext::build_client(call_timeout)?;

        Ok(Self {
            limits: ResourceLimits::new(config.max_wasm_memory_bytes, call_timeout),
            ttls: CacheTtls {
                listing: Duration::from_secs(cache.listing_ttl_secs),
                stream: Duration::from_secs(cache.stream_ttl_secs),
                hoster_info: Duration::from_secs(cache.hoster_info_ttl_secs),
            },
            config,
            instances: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: tokio::sync::Mutex::new(()),
            cache: ExtractionCache::new(),
            store,
            repository,
            client,
        })
    }

    pub fn profile(&self) -> &str {
        &self.config.profile
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // Loading

    /// Load from a manifest document and its source.
    ///
    /// `source` is the script body for script extensions, the module path for
    /// module extensions and the library directory for native extensions; an
    /// empty source falls back to the extension directory.
    pub async fn load_manifest_json(&self, manifest_json: &str, source: &str) -> Result<InstanceSummary> {
        let manifest = Manifest::from_json_str(manifest_json)?;
        self.load_manifest(manifest, source, true).await
    }

    /// Load a `manifest.json` from disk; the locator is resolved next to it
    pub async fn load_from_file(&self, manifest_path: &Path) -> Result<InstanceSummary> {
        let manifest_json = tokio::fs::read_to_string(manifest_path).await?;
        let manifest = Manifest::from_json_str(&manifest_json)?;
        let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

        let source = match &manifest.locator {
            Some(Locator::Script { path }) => tokio::fs::read_to_string(base_dir.join(path)).await?,
            Some(Locator::Module { path }) => absolute(&base_dir.join(path)),
            Some(Locator::Native { .. }) => absolute(base_dir),
            Some(Locator::Builtin) | None => {
                return Err(ExtensionError::ValidationError(format!(
                    "field 'locator' of '{}' must name a script, module or native artifact",
                    manifest.id
                )))
            }
        };

        self.load_manifest(manifest, &source, true).await
    }

    /// Load a `.zpe` package
    pub async fn load_package(&self, package_path: &Path) -> Result<InstanceSummary> {
        let path = package_path.to_path_buf();
        let package = tokio::task::spawn_blocking(move || ExtensionPackage::from_file(&path))
            .await
            .map_err(|e| ExtensionError::BackendLoadError(format!("package task failed: {}", e)))??;

        let report = check_compatible(&package.manifest)?;
        let source = absolute(package_path);
        self.install(package.manifest, report, Artifact::Module(package.wasm), source, true, true)
            .await
    }

    /// Register the built-in hoster extension
    pub async fn register_builtin(&self) -> Result<InstanceSummary> {
        self.register_backend(builtin_manifest()?, Arc::new(BuiltinHosterBackend::new()))
            .await
    }

    /// Register an in-process backend; such instances are not persisted
    pub async fn register_backend(&self, manifest: Manifest, backend: Arc<dyn PluginBackend>) -> Result<InstanceSummary> {
        let report = check_compatible(&manifest)?;
        let _guard = self.lifecycle.lock().await;
        self.teardown(&manifest.id).await;
        let instance = self.activate(manifest, backend, String::new(), true, report).await?;
        Ok(instance.summary())
    }

    async fn load_manifest(&self, manifest: Manifest, source: &str, persist: bool) -> Result<InstanceSummary> {
        self.load_with_state(manifest, source, true, persist).await
    }

    async fn load_with_state(&self, manifest: Manifest, source: &str, enabled: bool, persist: bool) -> Result<InstanceSummary> {
        let report = check_compatible(&manifest)?;
        let (artifact, persisted) = self.resolve_artifact(&manifest, source).await?;
        self.install(manifest, report, artifact, persisted, enabled, persist).await
    }

    async fn resolve_artifact(&self, manifest: &Manifest, source: &str) -> Result<(Artifact, String)> {
        let default_dir = self.config.extension_dir.join(&manifest.id);

        match &manifest.locator {
            None | Some(Locator::Script { .. }) => {
                if source.trim().is_empty() {
                    return Err(ExtensionError::ValidationError(format!(
                        "script source of '{}' is empty",
                        manifest.id
                    )));
                }
                Ok((Artifact::Script(source.to_string()), source.to_string()))
            }
            Some(Locator::Module { path }) => {
                let module_path = if source.is_empty() {
                    default_dir.join(path)
                } else {
                    PathBuf::from(source)
                };
                let bytes = tokio::fs::read(&module_path).await.map_err(|e| {
                    ExtensionError::BackendLoadError(format!("cannot read module {}: {}", module_path.display(), e))
                })?;
                Ok((Artifact::Module(bytes), absolute(&module_path)))
            }
            Some(Locator::Native { .. }) => {
                let base_dir = if source.is_empty() { default_dir } else { PathBuf::from(source) };
                let persisted = absolute(&base_dir);
                Ok((Artifact::Native(base_dir), persisted))
            }
            Some(Locator::Builtin) => Err(ExtensionError::ValidationError(format!(
                "'{}' declares a builtin locator; builtin extensions are compiled into the host",
                manifest.id
            ))),
        }
    }

    async fn install(
        &self,
        manifest: Manifest,
        report: CompatibilityReport,
        artifact: Artifact,
        source: String,
        enabled: bool,
        persist: bool,
    ) -> Result<InstanceSummary> {
        let id = manifest.id.clone();
        info!(extension_id = %id, version = %manifest.version, "Loading extension");

        verify_integrity(&manifest, &artifact).await?;

        let _guard = self.lifecycle.lock().await;
        if self.teardown(&id).await {
            info!(extension_id = %id, "Replaced previously loaded instance");
        }

        let backend: Arc<dyn PluginBackend> = match artifact {
            Artifact::Script(body) => Arc::new(ScriptBackend::create(&manifest, body, &self.limits).await?),
            Artifact::Module(bytes) => Arc::new(ModuleBackend::create(&manifest, &bytes, &self.limits).await?),
            Artifact::Native(base_dir) => Arc::new(NativeBackend::create(&manifest, &base_dir, &self.limits).await?),
        };

        let manifest_json = manifest.to_json()?;
        let instance = self.activate(manifest, backend, source.clone(), enabled, report).await?;

        if persist {
            if let Some(repository) = &self.repository {
                let record = ExtensionRecord {
                    profile: self.config.profile.clone(),
                    id: id.clone(),
                    manifest: manifest_json,
                    source,
                    enabled,
                    installed_at: chrono::Utc::now().to_rfc3339(),
                };
                if let Err(e) = repository.upsert(&record).await {
                    error!(extension_id = %id, error = %e, "Failed to persist extension");
                }
            }
        }

        Ok(instance.summary())
    }

    /// Wire a created backend to a fresh host surface and run `initialize`
    async fn activate(
        &self,
        manifest: Manifest,
        backend: Arc<dyn PluginBackend>,
        source: String,
        enabled: bool,
        report: CompatibilityReport,
    ) -> Result<Arc<ExtensionInstance>> {
        let id = manifest.id.clone();
        let surface = self.build_surface(&manifest);
        let instance = Arc::new(ExtensionInstance::new(manifest, backend, surface.clone(), source, enabled, report));

        instance.set_state(InstanceState::Initializing);
        self.instances.write().await.insert(id.clone(), instance.clone());

        if let Err(e) = instance.backend.initialize(surface).await {
            error!(extension_id = %id, error = %e, "Extension initialization failed");
            self.instances.write().await.remove(&id);
            instance.set_state(InstanceState::Unloaded);
            if let Err(shutdown_err) = instance.backend.shutdown().await {
                debug!(extension_id = %id, error = %shutdown_err, "Shutdown after failed init");
            }
            return Err(if e.is_load_failure() {
                e
            } else {
                ExtensionError::BackendLoadError(format!("initialization of '{}' failed: {}", id, e))
            });
        }

        instance.set_state(InstanceState::Ready);
        info!(
            extension_id = %id,
            backend = %instance.backend.backend_type(),
            capabilities = ?instance.manifest.advertised(),
            "Extension ready"
        );
        Ok(instance)
    }

    fn build_surface(&self, manifest: &Manifest) -> Arc<HostSurface> {
        let rate_limit = manifest.rate_limit_ms.unwrap_or(self.config.default_rate_limit_ms);
        let sandbox = Sandbox::new(
            &manifest.id,
            manifest.permissions(),
            manifest.allowed_domains().map(|d| d.to_vec()),
            self.limits.clone(),
        );

        Arc::new(HostSurface::new(
            &manifest.id,
            HOST_VERSION,
            manifest.config.clone(),
            sandbox,
            HttpContext::new(self.client.clone(), Duration::from_millis(rate_limit)),
            ExtensionStorage::new(&manifest.id, self.store.clone(), self.config.storage_quota_bytes),
        ))
    }

    /// Stop and drop an instance; returns whether one existed
    async fn teardown(&self, id: &str) -> bool {
        let instance = {
            let mut instances = self.instances.write().await;
            match instances.remove(id) {
                Some(instance) => {
                    instance.set_state(InstanceState::ShuttingDown);
                    instance
                }
                None => return false,
            }
        };

        let purged = self.cache.clear_extension(id);
        debug!(extension_id = %id, purged, "Purged cache entries");

        if let Err(e) = instance.backend.shutdown().await {
            warn!(extension_id = %id, error = %e, "Extension shutdown failed");
        }
        instance.set_state(InstanceState::Unloaded);
        true
    }

    /// Unload an instance and forget its persisted entry
    pub async fn unload(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.teardown(id).await {
            return Err(ExtensionError::NotFound(id.to_string()));
        }

        if let Some(repository) = &self.repository {
            repository.delete(&self.config.profile, id).await?;
        }

        info!(extension_id = %id, "Extension unloaded");
        Ok(())
    }

    /// Unload everything, keeping persisted entries
    pub async fn shutdown_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }

    /// Reload every persisted entry of the profile; failures are logged and skipped
    pub async fn restore(&self) -> Result<RestoreReport> {
        let repository = match &self.repository {
            Some(repository) => repository,
            None => return Ok(RestoreReport::default()),
        };

        let mut report = RestoreReport::default();
        for record in repository.find_all(&self.config.profile).await? {
            match self.restore_record(&record).await {
                Ok(_) => report.loaded.push(record.id),
                Err(e) => {
                    warn!(extension_id = %record.id, error = %e, "Skipping persisted extension");
                    report.failed.push(RestoreFailure {
                        id: record.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(loaded = report.loaded.len(), failed = report.failed.len(), "Restored extensions");
        Ok(report)
    }

    async fn restore_record(&self, record: &ExtensionRecord) -> Result<InstanceSummary> {
        if is_package_path(Path::new(&record.source)) {
            let path = PathBuf::from(&record.source);
            let package = tokio::task::spawn_blocking(move || ExtensionPackage::from_file(&path))
                .await
                .map_err(|e| ExtensionError::BackendLoadError(format!("package task failed: {}", e)))??;
            let report = check_compatible(&package.manifest)?;
            return self
                .install(
                    package.manifest,
                    report,
                    Artifact::Module(package.wasm),
                    record.source.clone(),
                    record.enabled,
                    false,
                )
                .await;
        }

        let manifest = Manifest::from_json_str(&record.manifest)?;
        self.load_with_state(manifest, &record.source, record.enabled, false).await
    }

    // Query surface

    async fn instance(&self, id: &str) -> Result<Arc<ExtensionInstance>> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    /// Instances matching `filter`, ordered by id
    async fn select<F>(&self, filter: F) -> Vec<Arc<ExtensionInstance>>
    where
        F: Fn(&ExtensionInstance) -> bool,
    {
        let mut selected: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| filter(i))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.id().cmp(b.id()));
        selected
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        self.select(|_| true).await.iter().map(|i| i.summary()).collect()
    }

    /// Dispatchable instances advertising `capability`
    pub async fn list_by_capability(&self, capability: Capability) -> Vec<InstanceSummary> {
        self.select(|i| i.is_dispatchable() && i.manifest.advertises(capability))
            .await
            .iter()
            .map(|i| i.summary())
            .collect()
    }

    /// Dispatchable instances of `kind`
    pub async fn list_by_kind(&self, kind: ExtensionKind) -> Vec<InstanceSummary> {
        self.select(|i| i.is_dispatchable() && i.manifest.kind == kind)
            .await
            .iter()
            .map(|i| i.summary())
            .collect()
    }

    pub async fn summary(&self, id: &str) -> Result<InstanceSummary> {
        Ok(self.instance(id).await?.summary())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<InstanceSummary> {
        let instance = self.instance(id).await?;
        instance.enabled.store(enabled, Ordering::SeqCst);

        if let Some(repository) = &self.repository {
            repository.set_enabled(&self.config.profile, id, enabled).await?;
        }

        info!(extension_id = %id, enabled, "Extension enabled flag changed");
        Ok(instance.summary())
    }

    /// Re-run the version check of a loaded instance against this host
    pub async fn check_compatibility(&self, id: &str) -> Result<CompatibilityReport> {
        let instance = self.instance(id).await?;
        check_manifest(&instance.manifest, HOST_VERSION, TargetPlatform::current())
    }

    pub fn validate_manifest(&self, raw: &Value) -> ValidationResult {
        manifest::validate(raw)
    }

    // Dispatch

    /// Call `capability` on instance `id` with a JSON argument object
    pub async fn invoke(&self, id: &str, capability: Capability, args: Value) -> Result<Value> {
        let instance = self.instance(id).await?;

        match instance.state() {
            InstanceState::Ready => {}
            state => {
                return Err(ExtensionError::InvalidState(format!(
                    "extension '{}' is {:?}",
                    id, state
                )))
            }
        }
        if !instance.is_enabled() {
            return Err(ExtensionError::InvalidState(format!("extension '{}' is disabled", id)));
        }
        if !instance.manifest.advertises(capability) {
            return Err(ExtensionError::PermissionDenied(format!(
                "extension '{}' does not advertise '{}'",
                id, capability
            )));
        }

        let (normalized, ordered) = capability.bind_args(&args)?;
        let key = CacheKey::new(id, instance.generation, capability, &ordered);
        let ttl = self.ttls.ttl_for(capability);
        let cacheable = instance.backend.is_cacheable(capability, &normalized);
        let timeout = self.limits.max_call_time + DISPATCH_GRACE;

        let backend = instance.backend.clone();
        let span = call_span(id, backend.backend_type(), capability);
        let watched = instance.clone();
        let started = Instant::now();

        let (result, source) = self
            .cache
            .get_or_fetch(
                key,
                ttl,
                move || cacheable && watched.state() == InstanceState::Ready,
                move || async move {
                    let call = backend.invoke(capability, normalized).instrument(span);
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ExtensionError::Timeout(format!(
                            "'{}' did not answer within {:?}",
                            capability, timeout
                        ))),
                    }
                },
            )
            .await;

        // Results of an instance unloaded mid-call are discarded
        if instance.state() != InstanceState::Ready {
            return Err(ExtensionError::InvalidState(format!(
                "extension '{}' was unloaded during the call",
                id
            )));
        }

        let elapsed = started.elapsed().as_millis() as u64;
        match (&result, source) {
            (Ok(_), CacheSource::Hit) => instance.stats().record_cache_hit(),
            (Ok(_), _) => instance.stats().record_success(elapsed),
            (Err(e), _) => {
                warn!(extension_id = %id, capability = %capability, error = %e, "Extension call failed");
                instance.stats().record_failure(e.error_type(), &e.to_string());
            }
        }
        debug!(extension_id = %id, capability = %capability, source = ?source, elapsed_ms = elapsed, "Extension call");

        result
    }

    async fn invoke_as<T: DeserializeOwned>(&self, id: &str, capability: Capability, args: Value) -> Result<T> {
        let value = self.invoke(id, capability, args).await?;
        serde_json::from_value(value).map_err(|e| {
            ExtensionError::ExecutionError(format!(
                "'{}' of '{}' returned a malformed {}: {}",
                capability,
                id,
                capability.returns(),
                e
            ))
        })
    }

    pub async fn search(&self, id: &str, query: &str, page: u32) -> Result<SearchResult> {
        self.invoke_as(id, Capability::Search, json!({ "query": query, "page": page }))
            .await
    }

    pub async fn get_popular(&self, id: &str, page: u32) -> Result<SearchResult> {
        self.invoke_as(id, Capability::GetPopular, json!({ "page": page })).await
    }

    pub async fn get_latest(&self, id: &str, page: u32) -> Result<SearchResult> {
        self.invoke_as(id, Capability::GetLatest, json!({ "page": page })).await
    }

    pub async fn get_episodes(&self, id: &str, anime_id: &str, page: u32) -> Result<EpisodesResult> {
        self.invoke_as(id, Capability::GetEpisodes, json!({ "animeId": anime_id, "page": page }))
            .await
    }

    pub async fn get_streams(&self, id: &str, anime_id: &str, episode_id: &str) -> Result<Vec<StreamDescriptor>> {
        self.invoke_as(
            id,
            Capability::GetStreams,
            json!({ "animeId": anime_id, "episodeId": episode_id }),
        )
        .await
    }

    pub async fn get_anime_details(&self, id: &str, anime_id: &str) -> Result<MediaItem> {
        self.invoke_as(id, Capability::GetAnimeDetails, json!({ "animeId": anime_id }))
            .await
    }

    pub async fn extract_stream(&self, id: &str, url: &str) -> Result<Option<StreamDescriptor>> {
        self.invoke_as(id, Capability::ExtractStream, json!({ "url": url })).await
    }

    pub async fn get_hoster_info(&self, id: &str) -> Result<Vec<HosterInfo>> {
        self.invoke_as(id, Capability::GetHosterInfo, json!({})).await
    }

    /// Try every stream provider until one yields a stream.
    ///
    /// Providers naming the URL's hoster go first; a failing provider is
    /// logged and the next one is tried.
    pub async fn resolve_stream(&self, url: &str) -> Result<Option<StreamResolution>> {
        let hoster = find_hoster(url).map(|h| h.name);
        let mut candidates = self
            .select(|i| {
                i.is_dispatchable()
                    && i.manifest.kind.resolves_streams()
                    && i.manifest.advertises(Capability::ExtractStream)
            })
            .await;

        if let Some(name) = hoster {
            candidates.sort_by_key(|i| !i.manifest.providers.iter().any(|p| p.eq_ignore_ascii_case(name)));
        }

        for candidate in candidates {
            match self.extract_stream(candidate.id(), url).await {
                Ok(Some(stream)) => {
                    return Ok(Some(StreamResolution {
                        extension_id: candidate.id().to_string(),
                        stream,
                    }))
                }
                Ok(None) => {
                    debug!(extension_id = %candidate.id(), url = %url, "No stream from provider");
                }
                Err(e) => {
                    warn!(extension_id = %candidate.id(), url = %url, error = %e, "Stream provider failed");
                }
            }
        }

        Ok(None)
    }

    /// Search every dispatchable instance advertising `search`, concurrently
    pub async fn search_all(&self, query: &str, page: u32) -> Vec<SearchOutcome> {
        let candidates = self
            .select(|i| i.is_dispatchable() && i.manifest.advertises(Capability::Search))
            .await;

        let searches = candidates.iter().map(|candidate| async move {
            let id = candidate.id().to_string();
            match self.search(&id, query, page).await {
                Ok(result) => SearchOutcome {
                    extension_id: id,
                    result: Some(result),
                    error: None,
                },
                Err(e) => SearchOutcome {
                    extension_id: id,
                    result: None,
                    error: Some(e.to_string()),
                },
            }
        });

        futures::future::join_all(searches).await
    }
}

fn check_compatible(manifest: &Manifest) -> Result<CompatibilityReport> {
    let report = check_manifest(manifest, HOST_VERSION, TargetPlatform::current())?.into_result()?;
    for warning in &report.warnings {
        warn!(extension_id = %manifest.id, "{}", warning);
    }
    Ok(report)
}

async fn verify_integrity(manifest: &Manifest, artifact: &Artifact) -> Result<()> {
    let expected = match manifest.integrity_hash() {
        Some(hash) => hash.trim_start_matches("sha256-").to_ascii_lowercase(),
        None => return Ok(()),
    };

    let mut hasher = Sha256::new();
    match artifact {
        Artifact::Script(body) => hasher.update(body.as_bytes()),
        Artifact::Module(bytes) => hasher.update(bytes),
        Artifact::Native(base_dir) => {
            let library = resolve_library(manifest, base_dir, TargetPlatform::current())?;
            hasher.update(tokio::fs::read(&library).await?);
        }
    }
    let actual = format!("{:x}", hasher.finalize());

    if actual != expected {
        return Err(ExtensionError::ValidationError(format!(
            "field 'security.integrityHash' of '{}' does not match: expected sha256-{}, artifact is sha256-{}",
            manifest.id, expected, actual
        )));
    }
    Ok(())
}

fn absolute(path: &Path) -> String {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    path.to_string_lossy().into_owned()
}
