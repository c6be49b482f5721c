//! Native shared-library backend
//!
//! A native extension ships one library per platform (`.so`, `.dylib`,
//! `.dll`) and exports a small C entry table:
//!
//! ```text
//! uint32_t  get_abi_version(void);
//! void*     create_plugin(void);
//! void      destroy_plugin(void* plugin);
//! FfiResult plugin_invoke(void* plugin, const char* method, const char* args_json);
//! void      plugin_free_result(FfiResult result);
//!
//! // optional
//! FfiResult plugin_initialize(void* plugin, const char* config_json);
//! void      plugin_set_http_callback(void* plugin, HostRequestFn request, HostFreeFn free, void* context);
//! ```
//!
//! When exported, `plugin_set_http_callback` receives the host's request
//! entry before `plugin_initialize` runs. The library calls
//! `request(context, request_json)` and releases the returned string with
//! `free`. Requests go through the same allowlist and rate limit as every
//! other extension request.
//!
//! Calls run on the blocking pool under `catch_unwind`, one at a time per library.

use libloading::{Library, Symbol};
use serde_json::{json, Value};
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

use super::capability::Capability;
use super::host::{HostSurface, HttpRequest, DEFAULT_USER_AGENT};
use super::manifest::{Locator, Manifest, TargetPlatform};
use super::sandbox::ResourceLimits;
use super::types::{BackendType, PluginBackend};
use crate::core::error::{ExtensionError, Result};

/// ABI revision a library must report from `get_abi_version`
pub const HOST_ABI_VERSION: u32 = 1;

/// Result envelope returned by `plugin_invoke`; strings are owned by the library
#[repr(C)]
pub struct FfiResult {
    pub success: u8,
    pub value: *mut c_char,
    pub error: *mut c_char,
}

/// Host request entry: `(context, request_json) -> response_json`
pub type HostRequestFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_char;
/// Releases a string returned by [`HostRequestFn`]
pub type HostFreeFn = unsafe extern "C" fn(*mut c_char);

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type CreateFn = unsafe extern "C" fn() -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type InvokeFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> FfiResult;
type FreeResultFn = unsafe extern "C" fn(FfiResult);
type InitializeFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> FfiResult;
type SetHttpCallbackFn = unsafe extern "C" fn(*mut c_void, HostRequestFn, HostFreeFn, *mut c_void);

/// Refuse libraries built against another ABI revision
pub fn check_abi_version(found: u32) -> Result<()> {
    if found != HOST_ABI_VERSION {
        return Err(ExtensionError::BackendLoadError(format!(
            "library ABI version {} does not match host ABI version {}",
            found, HOST_ABI_VERSION
        )));
    }
    Ok(())
}

/// Turn a decoded result envelope into the call's value
fn parse_result(success: bool, value: Option<String>, error: Option<String>) -> Result<Value> {
    if !success {
        return Err(ExtensionError::ExecutionError(
            error.unwrap_or_else(|| "native call failed".to_string()),
        ));
    }

    match value {
        Some(json) if !json.trim().is_empty() => Ok(serde_json::from_str(&json)?),
        _ => Ok(Value::Null),
    }
}

/// Configuration handed to `plugin_initialize`
fn init_config(surface: &HostSurface, capabilities: &[String]) -> Value {
    json!({
        "hostVersion": surface.host_version(),
        "userAgent": DEFAULT_USER_AGENT,
        "extensionId": surface.extension_id(),
        "capabilities": capabilities,
        "config": surface.config(),
    })
}

/// Context behind the pointer given to `plugin_set_http_callback`
struct HttpBridge {
    surface: Arc<HostSurface>,
    runtime: Handle,
}

impl HttpBridge {
    /// Run one request on the host runtime; must not be called from an async task
    fn dispatch(&self, request_json: &str) -> Value {
        let outcome = serde_json::from_str::<HttpRequest>(request_json)
            .map_err(|e| ExtensionError::ValidationError(format!("invalid request: {}", e)))
            .and_then(|request| self.runtime.block_on(self.surface.fetch(request)));

        match outcome {
            Ok(response) => json!({ "ok": true, "response": response }),
            Err(e) => json!({
                "ok": false,
                "error": { "type": e.error_type(), "message": e.to_string() },
            }),
        }
    }
}

unsafe extern "C" fn host_request(context: *mut c_void, request_json: *const c_char) -> *mut c_char {
    let reply = std::panic::catch_unwind(AssertUnwindSafe(|| {
        if context.is_null() || request_json.is_null() {
            return json!({
                "ok": false,
                "error": { "type": "ValidationError", "message": "null request" },
            });
        }
        let bridge = &*(context as *const HttpBridge);
        bridge.dispatch(&CStr::from_ptr(request_json).to_string_lossy())
    }))
    .unwrap_or_else(|_| {
        json!({
            "ok": false,
            "error": { "type": "ExecutionError", "message": "host request panicked" },
        })
    });

    CString::new(reply.to_string())
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn host_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Whether `path` has the shared-library extension of the running platform
pub fn is_valid_library_extension(path: &Path) -> bool {
    let extension = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext,
        None => return false,
    };

    #[cfg(target_os = "windows")]
    return extension.eq_ignore_ascii_case("dll");

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    return extension == "dylib";

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "ios")))]
    return extension == "so";
}

/// Library path for `platform` from a native locator, relative to `base_dir`
pub fn resolve_library(manifest: &Manifest, base_dir: &Path, platform: TargetPlatform) -> Result<PathBuf> {
    let libraries = match &manifest.locator {
        Some(Locator::Native { libraries }) => libraries,
        _ => {
            return Err(ExtensionError::BackendLoadError(format!(
                "extension '{}' has no native locator",
                manifest.id
            )))
        }
    };

    let key = platform.library_key();
    let relative = libraries.get(key).ok_or_else(|| {
        ExtensionError::BackendLoadError(format!(
            "extension '{}' ships no library for platform '{}'",
            manifest.id, key
        ))
    })?;

    Ok(base_dir.join(relative))
}

struct PluginHandle(*mut c_void);

// The handle is only dereferenced by the library, and calls are serialized by `call_lock`
unsafe impl Send for PluginHandle {}
unsafe impl Sync for PluginHandle {}

/// Loaded library plus the plugin object it created
struct NativeLibrary {
    handle: PluginHandle,
    invoke: InvokeFn,
    free_result: FreeResultFn,
    destroy_plugin: DestroyFn,
    initialize: Option<InitializeFn>,
    set_http_callback: Option<SetHttpCallbackFn>,
    destroyed: Mutex<bool>,
    call_lock: Mutex<()>,
    // Outlives the plugin object that holds a pointer to it
    bridge: Mutex<Option<Box<HttpBridge>>>,
    // Dropped last; the function pointers above point into it
    _library: Library,
}

impl NativeLibrary {
    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExtensionError::BackendLoadError(format!(
                "library file not found: {:?}",
                path
            )));
        }
        if !is_valid_library_extension(path) {
            return Err(ExtensionError::BackendLoadError(format!(
                "invalid library file extension: {:?}",
                path
            )));
        }

        let library = unsafe {
            Library::new(path)
                .map_err(|e| ExtensionError::BackendLoadError(format!("failed to load library {:?}: {}", path, e)))?
        };

        unsafe {
            let abi_version: AbiVersionFn = *symbol(&library, b"get_abi_version")?;
            let create: CreateFn = *symbol(&library, b"create_plugin")?;
            let destroy: DestroyFn = *symbol(&library, b"destroy_plugin")?;
            let invoke: InvokeFn = *symbol(&library, b"plugin_invoke")?;
            let free_result: FreeResultFn = *symbol(&library, b"plugin_free_result")?;
            let initialize = library.get::<InitializeFn>(b"plugin_initialize").ok().map(|s| *s);
            let set_http_callback = library
                .get::<SetHttpCallbackFn>(b"plugin_set_http_callback")
                .ok()
                .map(|s| *s);

            check_abi_version(abi_version())?;

            let handle = std::panic::catch_unwind(|| create())
                .map_err(|_| ExtensionError::BackendLoadError("create_plugin panicked".to_string()))?;
            if handle.is_null() {
                return Err(ExtensionError::BackendLoadError(
                    "create_plugin returned a null plugin".to_string(),
                ));
            }

            Ok(Self {
                handle: PluginHandle(handle),
                invoke,
                free_result,
                destroy_plugin: destroy,
                initialize,
                set_http_callback,
                destroyed: Mutex::new(false),
                call_lock: Mutex::new(()),
                bridge: Mutex::new(None),
                _library: library,
            })
        }
    }

    /// Blocking call into the library
    fn call(&self, method: &CStr, args: &CStr) -> Result<Value> {
        let _guard = self.call_lock.lock().unwrap_or_else(|p| p.into_inner());
        if *self.destroyed.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ExtensionError::InvalidState("native plugin was destroyed".to_string()));
        }

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            (self.invoke)(self.handle.0, method.as_ptr(), args.as_ptr())
        }))
        .map_err(|_| ExtensionError::ExecutionError("native call panicked".to_string()))?;

        self.take_result(result)
    }

    /// Hand over the request entry, then run `plugin_initialize`; both are optional
    fn initialize(&self, bridge: HttpBridge, config: &CStr) -> Result<()> {
        let _guard = self.call_lock.lock().unwrap_or_else(|p| p.into_inner());
        if *self.destroyed.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ExtensionError::InvalidState("native plugin was destroyed".to_string()));
        }

        if let Some(set_http_callback) = self.set_http_callback {
            let bridge = Box::new(bridge);
            let context = &*bridge as *const HttpBridge as *mut c_void;
            std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                set_http_callback(self.handle.0, host_request, host_free_string, context)
            }))
            .map_err(|_| ExtensionError::ExecutionError("plugin_set_http_callback panicked".to_string()))?;
            // The previous bridge, if any, is released only after the library holds the new one
            *self.bridge.lock().unwrap_or_else(|p| p.into_inner()) = Some(bridge);
        }

        if let Some(initialize) = self.initialize {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                initialize(self.handle.0, config.as_ptr())
            }))
            .map_err(|_| ExtensionError::ExecutionError("plugin_initialize panicked".to_string()))?;
            self.take_result(result)?;
        }
        Ok(())
    }

    fn take_result(&self, result: FfiResult) -> Result<Value> {
        let success = result.success != 0;
        let value = unsafe { owned_string(result.value) };
        let error = unsafe { owned_string(result.error) };
        unsafe { (self.free_result)(result) };
        parse_result(success, value, error)
    }

    fn destroy(&self) {
        let _guard = self.call_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut destroyed = self.destroyed.lock().unwrap_or_else(|p| p.into_inner());
        if !*destroyed {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                (self.destroy_plugin)(self.handle.0)
            }));
            *destroyed = true;
            self.bridge.lock().unwrap_or_else(|p| p.into_inner()).take();
        }
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        self.destroy();
    }
}

unsafe fn symbol<'lib, T>(library: &'lib Library, name: &[u8]) -> Result<Symbol<'lib, T>> {
    library.get::<T>(name).map_err(|e| {
        ExtensionError::BackendLoadError(format!(
            "missing symbol '{}': {}",
            String::from_utf8_lossy(name),
            e
        ))
    })
}

unsafe fn owned_string(ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

/// `PluginBackend` over a native library
pub struct NativeBackend {
    extension_id: String,
    capabilities: Vec<String>,
    library: Arc<NativeLibrary>,
    call_timeout: Duration,
}

impl NativeBackend {
    /// Open the library for the running platform and create the plugin object
    pub async fn create(manifest: &Manifest, base_dir: &Path, limits: &ResourceLimits) -> Result<Self> {
        let path = resolve_library(manifest, base_dir, TargetPlatform::current())?;

        let library = tokio::task::spawn_blocking(move || NativeLibrary::open(&path))
            .await
            .map_err(|e| ExtensionError::BackendLoadError(format!("library load task failed: {}", e)))??;

        tracing::info!(extension = %manifest.id, abi = HOST_ABI_VERSION, "native library loaded");

        Ok(Self {
            extension_id: manifest.id.clone(),
            capabilities: manifest
                .capabilities
                .iter()
                .filter(|(_, enabled)| **enabled)
                .map(|(name, _)| name.clone())
                .collect(),
            library: Arc::new(library),
            call_timeout: limits.max_call_time,
        })
    }
}

#[async_trait::async_trait]
impl PluginBackend for NativeBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Native
    }

    async fn initialize(&self, surface: Arc<HostSurface>) -> Result<()> {
        let config = CString::new(init_config(&surface, &self.capabilities).to_string())
            .map_err(|_| ExtensionError::ValidationError("config contains an interior NUL byte".to_string()))?;
        let bridge = HttpBridge {
            surface,
            runtime: Handle::current(),
        };

        let library = Arc::clone(&self.library);
        let task = tokio::task::spawn_blocking(move || library.initialize(bridge, &config));

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(ExtensionError::ExecutionError(format!("native init task failed: {}", e))),
            Err(_) => {
                return Err(ExtensionError::Timeout(format!(
                    "plugin_initialize exceeded {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }

        tracing::debug!(extension = %self.extension_id, "native plugin initialized");
        Ok(())
    }

    async fn invoke(&self, capability: Capability, args: Value) -> Result<Value> {
        let method = CString::new(capability.as_str())
            .map_err(|e| ExtensionError::ValidationError(e.to_string()))?;
        let args = CString::new(serde_json::to_string(&args)?).map_err(|_| {
            ExtensionError::ValidationError("arguments contain an interior NUL byte".to_string())
        })?;

        let library = Arc::clone(&self.library);
        let task = tokio::task::spawn_blocking(move || library.call(&method, &args));

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ExtensionError::ExecutionError(format!("native call task failed: {}", e))),
            Err(_) => Err(ExtensionError::Timeout(format!(
                "native call exceeded {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let library = Arc::clone(&self.library);
        tokio::task::spawn_blocking(move || library.destroy())
            .await
            .map_err(|e| ExtensionError::ExecutionError(format!("native shutdown task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::host::tests::{counting_target, surface};
    use crate::plugin::sandbox::Permission;
    use std::sync::atomic::Ordering;

    fn manifest(libraries: Value) -> Manifest {
        Manifest::from_value(json!({
            "id": "native-sample",
            "name": "Native Sample",
            "version": "1.0.0",
            "kind": "media-provider",
            "targetVersion": "0.4.0",
            "capabilities": { "search": true },
            "locator": { "type": "native", "libraries": libraries }
        }))
        .unwrap()
    }

    fn libraries_for_current(file: &str) -> Value {
        let mut libraries = serde_json::Map::new();
        libraries.insert(TargetPlatform::current().library_key().to_string(), json!(file));
        Value::Object(libraries)
    }

    #[test]
    fn test_library_extension() {
        #[cfg(target_os = "linux")]
        {
            assert!(is_valid_library_extension(Path::new("libsample.so")));
            assert!(!is_valid_library_extension(Path::new("sample.dll")));
        }
        assert!(!is_valid_library_extension(Path::new("sample")));
        assert!(!is_valid_library_extension(Path::new("sample.txt")));
    }

    #[test]
    fn test_resolve_library_by_platform() {
        let manifest = manifest(json!({ "linux": "lib/libsample.so", "windows": "sample.dll" }));
        let path = resolve_library(&manifest, Path::new("/ext"), TargetPlatform::Linux).unwrap();
        assert_eq!(path, PathBuf::from("/ext/lib/libsample.so"));

        let err = resolve_library(&manifest, Path::new("/ext"), TargetPlatform::Macos).unwrap_err();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("macos")));
    }

    #[tokio::test]
    async fn test_missing_library_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(libraries_for_current("missing.so"));

        let err = NativeBackend::create(&manifest, dir.path(), &ResourceLimits::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("not found")));
    }

    #[tokio::test]
    async fn test_non_library_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugin.txt"), b"not a library").unwrap();
        let manifest = manifest(libraries_for_current("plugin.txt"));

        let err = NativeBackend::create(&manifest, dir.path(), &ResourceLimits::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("extension")));
    }

    #[test]
    fn test_abi_version_check() {
        assert!(check_abi_version(HOST_ABI_VERSION).is_ok());

        let err = check_abi_version(HOST_ABI_VERSION + 1).unwrap_err();
        assert!(matches!(err, ExtensionError::BackendLoadError(ref m) if m.contains("ABI version 2")));
    }

    #[test]
    fn test_result_envelope() {
        let value = parse_result(true, Some(r#"{"items":[1,2]}"#.to_string()), None).unwrap();
        assert_eq!(value, json!({ "items": [1, 2] }));

        assert_eq!(parse_result(true, None, None).unwrap(), Value::Null);
        assert_eq!(parse_result(true, Some("  ".to_string()), None).unwrap(), Value::Null);

        let err = parse_result(false, None, Some("upstream gone".to_string())).unwrap_err();
        assert!(matches!(err, ExtensionError::ExecutionError(ref m) if m == "upstream gone"));

        let err = parse_result(false, Some("{}".to_string()), None).unwrap_err();
        assert!(matches!(err, ExtensionError::ExecutionError(_)));

        assert!(parse_result(true, Some("{not json".to_string()), None).is_err());
    }

    #[test]
    fn test_init_config_describes_host() {
        let surface = surface("native-sample", vec![], None);
        let config = init_config(&surface, &["search".to_string(), "extractStream".to_string()]);

        assert_eq!(config["hostVersion"], "0.4.2");
        assert_eq!(config["userAgent"], DEFAULT_USER_AGENT);
        assert_eq!(config["extensionId"], "native-sample");
        assert_eq!(config["capabilities"], json!(["search", "extractStream"]));
    }

    /// Call the request entry the way a library would, from a non-async thread
    async fn request_through_entry(bridge: HttpBridge, request: String) -> Value {
        tokio::task::spawn_blocking(move || unsafe {
            let request = CString::new(request).unwrap();
            let context = &bridge as *const HttpBridge as *mut c_void;
            let reply = host_request(context, request.as_ptr());
            assert!(!reply.is_null());
            let parsed = serde_json::from_str(&CStr::from_ptr(reply).to_string_lossy()).unwrap();
            host_free_string(reply);
            parsed
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_entry_fetches_through_surface() {
        let (target, hits) = counting_target().await;
        let bridge = HttpBridge {
            surface: Arc::new(surface("native-sample", vec![Permission::Network], Some(vec!["127.0.0.1"]))),
            runtime: Handle::current(),
        };

        let request = json!({ "url": format!("http://127.0.0.1:{}/x", target.port()) }).to_string();
        let reply = request_through_entry(bridge, request).await;

        assert_eq!(reply["ok"], true);
        assert_eq!(reply["response"]["status"], 200);
        assert_eq!(reply["response"]["body"], "secret");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_entry_applies_allowlist() {
        let (target, hits) = counting_target().await;
        let bridge = HttpBridge {
            surface: Arc::new(surface("native-sample", vec![Permission::Network], Some(vec!["example.com"]))),
            runtime: Handle::current(),
        };

        let request = json!({ "url": format!("http://127.0.0.1:{}/x", target.port()) }).to_string();
        let reply = request_through_entry(bridge, request).await;

        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["type"], "PermissionDenied");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_entry_rejects_malformed_request() {
        let bridge = HttpBridge {
            surface: Arc::new(surface("native-sample", vec![Permission::Network], None)),
            runtime: Handle::current(),
        };

        let reply = request_through_entry(bridge, "{\"method\":\"GET\"}".to_string()).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["type"], "ValidationError");

        let reply = unsafe { host_request(std::ptr::null_mut(), std::ptr::null()) };
        let parsed: Value = serde_json::from_str(&unsafe { CStr::from_ptr(reply) }.to_string_lossy()).unwrap();
        unsafe { host_free_string(reply) };
        assert_eq!(parsed["ok"], false);
    }
}
