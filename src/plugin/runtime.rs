//! Linear-memory module backend
//!
//! Binary modules run on wasmtime with async support. The calling convention:
//! - the module exports `memory`, `allocate(i32) -> i32` and `deallocate(i32, i32)`
//! - optional `initialize()` and `shutdown()` hooks
//! - one `zpe_<capability>` export per capability, `(ptr, len) -> i64`, taking a
//!   JSON argument object and returning `(result_ptr << 32) | result_len`
//! - results are `{ success, value, error }` envelopes
//!
//! The host imports `env.log_message(ptr, len)` and `env.get_timestamp() -> i64`.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use wasmtime::{
    AsContext, Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, ResourceLimiter, Store, Trap,
    TypedFunc,
};

use super::capability::Capability;
use super::host::HostSurface;
use super::manifest::Manifest;
use super::sandbox::ResourceLimits;
use super::types::{BackendType, PluginBackend};
use crate::core::error::{ExtensionError, Result};

pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Export name for a capability: `getAnimeDetails` → `zpe_get_anime_details`
pub fn export_name(capability: Capability) -> String {
    let mut name = String::from("zpe_");
    for c in capability.as_str().chars() {
        if c.is_ascii_uppercase() {
            name.push('_');
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

/// Caps the total linear memory of one store
pub struct StoreLimits {
    max_memory_bytes: usize,
    current_memory_bytes: usize,
}

impl StoreLimits {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            max_memory_bytes,
            current_memory_bytes: 0,
        }
    }

    pub fn current_memory(&self) -> usize {
        self.current_memory_bytes
    }
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> std::result::Result<bool, anyhow::Error> {
        let delta = desired.saturating_sub(current);
        let new_total = self.current_memory_bytes.saturating_add(delta);

        if new_total <= self.max_memory_bytes {
            self.current_memory_bytes = new_total;
            Ok(true)
        } else {
            tracing::warn!(
                current = current,
                desired = desired,
                limit = self.max_memory_bytes,
                "module memory limit exceeded"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> std::result::Result<bool, anyhow::Error> {
        Ok(desired <= 10_000)
    }
}

struct ModuleState {
    extension_id: String,
    surface: Option<Arc<HostSurface>>,
    limits: StoreLimits,
}

struct ModuleInstance {
    store: Store<ModuleState>,
    instance: Instance,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<(i32, i32), ()>,
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    success: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Byte range `ptr..ptr+len` if it lies inside the memory
fn region(memory: &Memory, store: impl AsContext, ptr: i32, len: usize) -> Option<usize> {
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(len)?;
    (end <= memory.data_size(store)).then_some(start)
}

fn load_error(stage: &str, e: impl std::fmt::Display) -> ExtensionError {
    ExtensionError::BackendLoadError(format!("{}: {}", stage, e))
}

fn add_host_functions(linker: &mut Linker<ModuleState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "log_message",
            |mut caller: Caller<'_, ModuleState>, ptr: i32, len: i32| {
                let memory = match caller.get_export("memory") {
                    Some(Extern::Memory(memory)) => memory,
                    _ => return,
                };
                let len = usize::try_from(len).unwrap_or(0);
                let message = match region(&memory, &caller, ptr, len) {
                    Some(start) => String::from_utf8_lossy(&memory.data(&caller)[start..start + len]).into_owned(),
                    None => return,
                };
                match &caller.data().surface {
                    Some(surface) => surface.logger().info(&message),
                    None => tracing::info!(extension = %caller.data().extension_id, "{}", message),
                }
            },
        )
        .map_err(|e| load_error("failed to add log_message", e))?;

    linker
        .func_wrap("env", "get_timestamp", || -> i64 { chrono::Utc::now().timestamp_millis() })
        .map_err(|e| load_error("failed to add get_timestamp", e))?;

    Ok(())
}

/// `PluginBackend` over a wasmtime instance
pub struct ModuleBackend {
    extension_id: String,
    engine: Engine,
    inner: Mutex<ModuleInstance>,
    call_timeout: Duration,
}

impl ModuleBackend {
    /// Compile and instantiate `bytes` (binary or text format).
    ///
    /// Fails with `BackendLoadError` when a required export or an export for an
    /// advertised capability is missing.
    pub async fn create(manifest: &Manifest, bytes: &[u8], limits: &ResourceLimits) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config).map_err(|e| load_error("failed to create engine", e))?;
        let module = Module::new(&engine, bytes).map_err(|e| load_error("failed to compile module", e))?;

        let mut linker = Linker::new(&engine);
        add_host_functions(&mut linker)?;

        let mut store = Store::new(
            &engine,
            ModuleState {
                extension_id: manifest.id.clone(),
                surface: None,
                limits: StoreLimits::new(limits.max_memory_bytes),
            },
        );
        store.limiter(|state| &mut state.limits);

        let watchdog = arm(&engine, &mut store, limits.max_call_time);
        let instance = linker.instantiate_async(&mut store, &module).await;
        watchdog.abort();
        let instance = instance.map_err(|e| load_error("failed to instantiate module", e))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| load_error("missing export", "memory"))?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate")
            .map_err(|e| load_error("export 'allocate(i32) -> i32'", e))?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
            .map_err(|e| load_error("export 'deallocate(i32, i32)'", e))?;

        for capability in manifest.advertised() {
            let name = export_name(capability);
            instance
                .get_typed_func::<(i32, i32), i64>(&mut store, &name)
                .map_err(|e| load_error(&format!("export '{}' for {}", name, capability), e))?;
        }

        tracing::debug!(
            extension = %manifest.id,
            memory_bytes = store.data().limits.current_memory(),
            "module instantiated"
        );

        Ok(Self {
            extension_id: manifest.id.clone(),
            engine,
            inner: Mutex::new(ModuleInstance {
                store,
                instance,
                memory,
                allocate,
                deallocate,
            }),
            call_timeout: limits.max_call_time,
        })
    }

    fn call_error(&self, stage: &str, e: anyhow::Error) -> ExtensionError {
        if e.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
            ExtensionError::Timeout(format!("{} exceeded {}ms", stage, self.call_timeout.as_millis()))
        } else {
            ExtensionError::ExecutionError(format!("{} failed: {}", stage, e))
        }
    }

    async fn run_hook(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inst = &mut *guard;

        let hook = match inst.instance.get_typed_func::<(), ()>(&mut inst.store, name) {
            Ok(hook) => hook,
            Err(_) => return Ok(()),
        };

        let watchdog = arm(&self.engine, &mut inst.store, self.call_timeout);
        let result = hook.call_async(&mut inst.store, ()).await;
        watchdog.abort();
        result.map_err(|e| self.call_error(name, e))
    }

    async fn call_export(&self, inst: &mut ModuleInstance, name: &str, blob: &[u8]) -> Result<Vec<u8>> {
        let func = inst
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut inst.store, name)
            .map_err(|e| ExtensionError::ExecutionError(format!("export '{}': {}", name, e)))?;

        let len = i32::try_from(blob.len())
            .map_err(|_| ExtensionError::BackendLoadError(format!("argument blob of {} bytes is too large", blob.len())))?;

        let ptr = inst
            .allocate
            .call_async(&mut inst.store, len)
            .await
            .map_err(|e| self.call_error("allocate", e))?;

        let start = region(&inst.memory, &inst.store, ptr, blob.len()).ok_or_else(|| {
            ExtensionError::BackendLoadError(format!(
                "allocation of {} bytes at {} does not fit in {} bytes of memory",
                blob.len(),
                ptr,
                inst.memory.data_size(&inst.store)
            ))
        })?;
        inst.memory
            .write(&mut inst.store, start, blob)
            .map_err(|e| ExtensionError::BackendLoadError(e.to_string()))?;

        let packed = func
            .call_async(&mut inst.store, (ptr, len))
            .await
            .map_err(|e| self.call_error(name, e))?;
        inst.deallocate
            .call_async(&mut inst.store, (ptr, len))
            .await
            .map_err(|e| self.call_error("deallocate", e))?;

        let result_ptr = (packed >> 32) as i32;
        let result_len = (packed & 0xFFFF_FFFF) as u32 as usize;
        if result_ptr == 0 {
            return Err(ExtensionError::ExecutionError(format!("'{}' returned a null result", name)));
        }

        let start = region(&inst.memory, &inst.store, result_ptr, result_len).ok_or_else(|| {
            ExtensionError::ExecutionError(format!(
                "'{}' returned {} bytes at {} outside memory",
                name, result_len, result_ptr
            ))
        })?;
        let out = inst.memory.data(&inst.store)[start..start + result_len].to_vec();

        if let Ok(result_len) = i32::try_from(result_len) {
            inst.deallocate
                .call_async(&mut inst.store, (result_ptr, result_len))
                .await
                .map_err(|e| self.call_error("deallocate", e))?;
        }

        Ok(out)
    }
}

/// Set a one-tick deadline and bump the epoch once `timeout` elapses
fn arm(engine: &Engine, store: &mut Store<ModuleState>, timeout: Duration) -> tokio::task::JoinHandle<()> {
    store.set_epoch_deadline(1);
    let engine = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        engine.increment_epoch();
    })
}

#[async_trait::async_trait]
impl PluginBackend for ModuleBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Module
    }

    async fn initialize(&self, surface: Arc<HostSurface>) -> Result<()> {
        self.inner.lock().await.store.data_mut().surface = Some(surface);
        self.run_hook("initialize").await
    }

    async fn invoke(&self, capability: Capability, args: Value) -> Result<Value> {
        let blob = serde_json::to_vec(&args)?;
        let name = export_name(capability);

        let mut guard = self.inner.lock().await;
        let inst = &mut *guard;

        let watchdog = arm(&self.engine, &mut inst.store, self.call_timeout);
        let raw = self.call_export(inst, &name, &blob).await;
        watchdog.abort();

        let envelope: ResultEnvelope = serde_json::from_slice(&raw?)
            .map_err(|e| ExtensionError::ExecutionError(format!("'{}' returned an invalid envelope: {}", name, e)))?;

        if envelope.success {
            Ok(envelope.value)
        } else {
            Err(ExtensionError::ExecutionError(
                envelope.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let result = self.run_hook("shutdown").await;
        if let Err(e) = &result {
            tracing::warn!(extension = %self.extension_id, "module shutdown hook failed: {}", e);
        }
        self.inner.lock().await.store.data_mut().surface = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::host::tests::surface;
    use serde_json::json;

    const SAMPLE_WAT: &str = r#"
        (module
          (import "env" "log_message" (func $log (param i32 i32)))
          (import "env" "get_timestamp" (func $now (result i64)))
          (memory (export "memory") 1)
          (global $next (mut i32) (i32.const 4096))
          (data (i32.const 1024) "{\"success\":true,\"value\":{\"results\":[{\"id\":\"1\",\"title\":\"Sample\"}],\"hasNextPage\":false}}")
          (data (i32.const 1200) "{\"success\":false,\"error\":\"no stream\"}")
          (data (i32.const 1300) "searching")
          (func (export "allocate") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $next))
            (global.set $next (i32.add (global.get $next) (local.get $size)))
            (local.get $ptr))
          (func (export "deallocate") (param i32 i32))
          (func (export "initialize")
            (drop (call $now)))
          (func (export "zpe_search") (param i32 i32) (result i64)
            (call $log (i32.const 1300) (i32.const 9))
            (i64.const 4398046511190))
          (func (export "zpe_extract_stream") (param i32 i32) (result i64)
            (i64.const 5153960755237))
          (func (export "zpe_get_popular") (param i32 i32) (result i64)
            (loop $spin (br $spin))
            (i64.const 0)))
    "#;

    fn manifest(capabilities: Value) -> Manifest {
        Manifest::from_value(json!({
            "id": "module-sample",
            "name": "Module Sample",
            "version": "1.0.0",
            "kind": "hybrid",
            "targetVersion": "0.4.0",
            "capabilities": capabilities,
            "permissions": ["logging"]
        }))
        .unwrap()
    }

    async fn sample(limits: ResourceLimits) -> ModuleBackend {
        let manifest = manifest(json!({ "search": true, "extractStream": true, "getPopular": true }));
        let backend = ModuleBackend::create(&manifest, SAMPLE_WAT.as_bytes(), &limits)
            .await
            .unwrap();
        backend
            .initialize(Arc::new(surface("module-sample", vec![], None)))
            .await
            .unwrap();
        backend
    }

    #[test]
    fn test_export_names() {
        assert_eq!(export_name(Capability::Search), "zpe_search");
        assert_eq!(export_name(Capability::GetAnimeDetails), "zpe_get_anime_details");
        assert_eq!(export_name(Capability::ExtractStream), "zpe_extract_stream");
    }

    #[tokio::test]
    async fn test_search_envelope() {
        let backend = sample(ResourceLimits::default()).await;
        let value = backend
            .invoke(Capability::Search, json!({ "query": "sample", "page": 1 }))
            .await
            .unwrap();
        assert_eq!(value["results"][0]["title"], "Sample");
        assert_eq!(value["hasNextPage"], false);
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_envelope() {
        let backend = sample(ResourceLimits::default()).await;
        let err = backend
            .invoke(Capability::ExtractStream, json!({ "url": "https://voe.sx/e/1" }))
            .await
            .unwrap_err();
        assert_eq!(err, ExtensionError::ExecutionError("no stream".to_string()));
    }

    #[tokio::test]
    async fn test_runaway_call_times_out() {
        let backend = sample(ResourceLimits::new(16 * 1024 * 1024, Duration::from_millis(100))).await;
        let err = backend
            .invoke(Capability::GetPopular, json!({ "page": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Timeout(_)));

        // The instance stays usable after an interrupted call
        assert!(backend.invoke(Capability::Search, json!({ "query": "x" })).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversize_argument_is_load_error() {
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "allocate") (param i32) (result i32) (i32.const 65500))
              (func (export "deallocate") (param i32 i32))
              (func (export "zpe_search") (param i32 i32) (result i64) (i64.const 0)))
        "#;
        let manifest = manifest(json!({ "search": true }));
        let backend = ModuleBackend::create(&manifest, wat.as_bytes(), &ResourceLimits::default())
            .await
            .unwrap();

        let err = backend
            .invoke(Capability::Search, json!({ "query": "x".repeat(100) }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::BackendLoadError(_)));
    }

    #[tokio::test]
    async fn test_missing_exports() {
        let wat = r#"(module (memory (export "memory") 1))"#;
        let err = ModuleBackend::create(&manifest(json!({})), wat.as_bytes(), &ResourceLimits::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("allocate")));

        let err = ModuleBackend::create(
            &manifest(json!({ "getEpisodes": true })),
            SAMPLE_WAT.as_bytes(),
            &ResourceLimits::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("zpe_get_episodes")));
    }

    #[tokio::test]
    async fn test_memory_cap() {
        let wat = r#"(module (memory (export "memory") 300))"#;
        let err = ModuleBackend::create(&manifest(json!({})), wat.as_bytes(), &ResourceLimits::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::BackendLoadError(_)));
    }
}
