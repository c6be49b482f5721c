//! Script extension backend
//!
//! Script extensions run inside a deno_core isolate. The isolate is `!Send`,
//! so every backend owns a dedicated worker thread with a current-thread
//! tokio runtime and a `LocalSet`; the dispatcher talks to it over a command
//! channel.
//!
//! The extension source is compiled as the body of a function whose only
//! parameters are the host capability objects (`http`, `html`, `storage`,
//! `log`, `host`) plus `exports`/`module`. `Deno`, `globalThis` and `fetch`
//! are shadowed by `undefined` parameters. The bootstrap keeps the op table in
//! its own closure and deletes `Deno` from the global object, so code that
//! recovers the global through `Function` or indirect `eval` finds no ops.

use deno_core::{op2, v8, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::capability::Capability;
use super::host::{HostSurface, HttpRequest, HttpResponse, MarkupExtractor};
use super::manifest::Manifest;
use super::sandbox::ResourceLimits;
use super::storage::StorageUsage;
use super::types::{BackendType, PluginBackend};
use crate::core::error::{ExtensionError, Result};

const HOST_GLOBAL: &str = "__extensionHost";
const STATUS_GLOBAL: &str = "__extensionStatus";
const RESULT_GLOBAL: &str = "__extensionResult";
const ERROR_GLOBAL: &str = "__extensionError";

/// Installed once per isolate before any extension code runs
const BOOTSTRAP: &str = r#"
(function (ops) {
  "use strict";

  const state = { exports: null };

  function settle(run) {
    globalThis.__extensionStatus = "pending";
    globalThis.__extensionResult = undefined;
    globalThis.__extensionError = undefined;
    return Promise.resolve()
      .then(run)
      .then(
        (value) => {
          globalThis.__extensionResult = JSON.stringify(value === undefined ? null : value);
          globalThis.__extensionStatus = "success";
        },
        (e) => {
          globalThis.__extensionError = e instanceof Error ? `${e.name}: ${e.message}` : String(e);
          globalThis.__extensionStatus = "error";
        },
      );
  }

  const http = Object.freeze({
    request: (req) => ops.op_ext_http(req),
    get: (url, headers) => ops.op_ext_http({ url, method: "GET", headers: headers || {} }),
    post: (url, body, headers) =>
      ops.op_ext_http({
        url,
        method: "POST",
        headers: headers || {},
        body: typeof body === "string" ? body : JSON.stringify(body),
      }),
  });

  const html = Object.freeze({
    extract: (body, pattern) => ops.op_ext_html_extract(String(body), String(pattern)),
    extractAll: (body, pattern) => ops.op_ext_html_extract_all(String(body), String(pattern)),
    text: (body) => ops.op_ext_html_text(String(body)),
  });

  const storage = Object.freeze({
    get: async (key, fallback) => {
      const value = await ops.op_ext_storage_get(String(key));
      return value === null || value === undefined ? (fallback === undefined ? null : fallback) : value;
    },
    set: (key, value) => ops.op_ext_storage_set(String(key), value === undefined ? null : value),
    remove: (key) => ops.op_ext_storage_remove(String(key)),
    clear: () => ops.op_ext_storage_clear(),
    keys: () => ops.op_ext_storage_keys(),
    usage: () => ops.op_ext_storage_usage(),
  });

  const emit = (level) => (...parts) =>
    ops.op_ext_log({
      level,
      message: parts.map((p) => (typeof p === "string" ? p : JSON.stringify(p))).join(" "),
    });
  const log = Object.freeze({
    debug: emit("debug"),
    info: emit("info"),
    warn: emit("warn"),
    error: emit("error"),
  });

  function load(source, hostInfo) {
    return settle(() => {
      const host = Object.freeze(hostInfo);
      const module = { exports: {} };
      const body = new Function(
        "exports", "module", "http", "html", "storage", "log", "host",
        "Deno", "globalThis", "fetch",
        '"use strict";\n' + source,
      );
      body.call(undefined, module.exports, module, http, html, storage, log, host,
        undefined, undefined, undefined);
      state.exports = module.exports;
      if (state.exports && typeof state.exports.init === "function") {
        return state.exports.init(host.config);
      }
      return null;
    });
  }

  function invoke(name, args, optional) {
    return settle(() => {
      const fn = state.exports ? state.exports[name] : undefined;
      if (typeof fn !== "function") {
        if (optional) return null;
        throw new Error(`extension does not export '${name}'`);
      }
      return fn.apply(undefined, args);
    });
  }

  Object.defineProperty(globalThis, "__extensionHost", {
    value: Object.freeze({ load, invoke }),
    writable: false,
    configurable: false,
  });
})(Deno.core.ops);

delete globalThis.Deno;
if (typeof globalThis.Deno !== "undefined") {
  throw new Error("Deno namespace could not be removed from the global object");
}
"#;

fn host_surface(state: &OpState) -> Arc<HostSurface> {
    state.borrow::<Arc<HostSurface>>().clone()
}

#[op2(async)]
#[serde]
async fn op_ext_http(
    state: Rc<RefCell<OpState>>,
    #[serde] request: HttpRequest,
) -> std::result::Result<HttpResponse, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.fetch(request).await?)
}

#[op2]
#[string]
fn op_ext_html_extract(
    #[string] body: String,
    #[string] pattern: String,
) -> std::result::Result<Option<String>, anyhow::Error> {
    Ok(MarkupExtractor::extract(&body, &pattern)?)
}

#[op2]
#[serde]
fn op_ext_html_extract_all(
    #[string] body: String,
    #[string] pattern: String,
) -> std::result::Result<Vec<String>, anyhow::Error> {
    Ok(MarkupExtractor::extract_all(&body, &pattern)?)
}

#[op2]
#[string]
fn op_ext_html_text(#[string] body: String) -> String {
    MarkupExtractor::strip_tags(&body)
}

#[op2(async)]
#[serde]
async fn op_ext_storage_get(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> std::result::Result<Option<Value>, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.get(&key).await?)
}

#[op2(async)]
async fn op_ext_storage_set(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) -> std::result::Result<(), anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.set(&key, value).await?)
}

#[op2(async)]
async fn op_ext_storage_remove(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> std::result::Result<bool, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.remove(&key).await?)
}

#[op2(async)]
#[serde]
async fn op_ext_storage_clear(state: Rc<RefCell<OpState>>) -> std::result::Result<u64, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.clear().await?)
}

#[op2(async)]
#[serde]
async fn op_ext_storage_keys(
    state: Rc<RefCell<OpState>>,
) -> std::result::Result<Vec<String>, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.keys().await?)
}

#[op2(async)]
#[serde]
async fn op_ext_storage_usage(
    state: Rc<RefCell<OpState>>,
) -> std::result::Result<StorageUsage, anyhow::Error> {
    let surface = host_surface(&state.borrow());
    Ok(surface.storage()?.usage().await?)
}

#[derive(Debug, Deserialize)]
struct LogRecord {
    level: String,
    message: String,
}

#[op2]
fn op_ext_log(state: &mut OpState, #[serde] record: LogRecord) {
    if let Some(surface) = state.try_borrow::<Arc<HostSurface>>() {
        surface.logger().log(&record.level, &record.message);
    }
}

fn host_extension() -> Extension {
    Extension {
        name: "extension_host",
        ops: std::borrow::Cow::Borrowed(&[
            op_ext_http::DECL,
            op_ext_html_extract::DECL,
            op_ext_html_extract_all::DECL,
            op_ext_html_text::DECL,
            op_ext_storage_get::DECL,
            op_ext_storage_set::DECL,
            op_ext_storage_remove::DECL,
            op_ext_storage_clear::DECL,
            op_ext_storage_keys::DECL,
            op_ext_storage_usage::DECL,
            op_ext_log::DECL,
        ]),
        ..Default::default()
    }
}

/// One isolate with the bootstrap installed
struct ScriptExecutor {
    runtime: JsRuntime,
}

impl ScriptExecutor {
    fn new() -> anyhow::Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![host_extension()],
            ..Default::default()
        });
        runtime.execute_script("<extension_host>", BOOTSTRAP.to_string().into())?;
        Ok(Self { runtime })
    }

    fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Call `__extensionHost[method](...args)` and drive the event loop until it settles
    async fn call(&mut self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        self.runtime.v8_isolate().cancel_terminate_execution();

        {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let host_key = v8::String::new(scope, HOST_GLOBAL)
                .ok_or_else(|| anyhow::anyhow!("failed to allocate key"))?;
            let host_val = global
                .get(scope, host_key.into())
                .ok_or_else(|| anyhow::anyhow!("{} not installed", HOST_GLOBAL))?;
            let host = v8::Local::<v8::Object>::try_from(host_val)
                .map_err(|_| anyhow::anyhow!("{} is not an object", HOST_GLOBAL))?;

            let method_key = v8::String::new(scope, method)
                .ok_or_else(|| anyhow::anyhow!("failed to allocate key"))?;
            let func_val = host
                .get(scope, method_key.into())
                .ok_or_else(|| anyhow::anyhow!("{}.{} not found", HOST_GLOBAL, method))?;
            let func = v8::Local::<v8::Function>::try_from(func_val)
                .map_err(|_| anyhow::anyhow!("{}.{} is not a function", HOST_GLOBAL, method))?;

            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                let json = serde_json::to_string(arg)?;
                let json = v8::String::new(scope, &json)
                    .ok_or_else(|| anyhow::anyhow!("argument too large"))?;
                let value = v8::json::parse(scope, json)
                    .ok_or_else(|| anyhow::anyhow!("failed to parse arguments in V8"))?;
                argv.push(value);
            }

            let recv = v8::undefined(scope).into();
            if func.call(scope, recv, &argv).is_none() {
                return Err(anyhow::anyhow!("failed to call {}.{}", HOST_GLOBAL, method));
            }
        }

        self.runtime.run_event_loop(Default::default()).await?;

        let outcome = {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let get_global_string = |scope: &mut v8::HandleScope, key: &str| -> Option<String> {
                let key = v8::String::new(scope, key)?;
                let val = global.get(scope, key.into())?;
                if val.is_undefined() || val.is_null() {
                    return None;
                }
                Some(val.to_string(scope)?.to_rust_string_lossy(scope))
            };

            match get_global_string(scope, STATUS_GLOBAL).as_deref() {
                Some("success") => get_global_string(scope, RESULT_GLOBAL)
                    .ok_or_else(|| "call finished without a result".to_string()),
                Some("error") => Err(get_global_string(scope, ERROR_GLOBAL)
                    .unwrap_or_else(|| "unknown error".to_string())),
                Some("pending") => Err("event loop finished but the call is still pending".to_string()),
                Some(other) => Err(format!("invalid call status '{}'", other)),
                None => Err("call status missing".to_string()),
            }
        };

        // Results can hold large strings; release them before the next call
        let _ = self.runtime.execute_script(
            "<cleanup>",
            r#"
            globalThis.__extensionResult = undefined;
            globalThis.__extensionError = undefined;
            globalThis.__extensionStatus = undefined;
            "#
            .to_string()
            .into(),
        );

        match outcome {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

enum ScriptCommand {
    Initialize {
        surface: Arc<HostSurface>,
        resp: oneshot::Sender<Result<()>>,
    },
    Invoke {
        name: String,
        args: Vec<Value>,
        optional: bool,
        resp: oneshot::Sender<Result<Value>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

fn execution_error(e: anyhow::Error) -> ExtensionError {
    ExtensionError::ExecutionError(e.to_string())
}

/// `PluginBackend` over a script running on its own isolate thread
pub struct ScriptBackend {
    extension_id: String,
    tx: mpsc::Sender<ScriptCommand>,
    isolate: v8::IsolateHandle,
    call_timeout: Duration,
}

impl ScriptBackend {
    /// Start the worker thread and install the bootstrap; `source` is compiled on initialize
    pub async fn create(manifest: &Manifest, source: String, limits: &ResourceLimits) -> Result<Self> {
        let extension_id = manifest.id.clone();
        let (tx, mut rx) = mpsc::channel::<ScriptCommand>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<v8::IsolateHandle>>();

        let worker_id = extension_id.clone();
        thread::Builder::new()
            .name(format!("script-{}", extension_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ExtensionError::BackendLoadError(format!(
                            "failed to start script runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut executor = match ScriptExecutor::new() {
                        Ok(executor) => executor,
                        Err(e) => {
                            let _ = ready_tx.send(Err(ExtensionError::BackendLoadError(e.to_string())));
                            return;
                        }
                    };
                    if ready_tx.send(Ok(executor.isolate_handle())).is_err() {
                        return;
                    }
                    debug!(extension = %worker_id, "script worker ready");

                    while let Some(cmd) = rx.recv().await {
                        match cmd {
                            ScriptCommand::Initialize { surface, resp } => {
                                let host_info = surface.host_info();
                                executor.runtime.op_state().borrow_mut().put(surface);
                                let result = executor
                                    .call("load", &[Value::String(source.clone()), host_info])
                                    .await
                                    .map(|_| ())
                                    .map_err(|e| ExtensionError::BackendLoadError(e.to_string()));
                                let _ = resp.send(result);
                            }
                            ScriptCommand::Invoke {
                                name,
                                args,
                                optional,
                                resp,
                            } => {
                                let result = executor
                                    .call("invoke", &[Value::String(name), Value::Array(args), Value::Bool(optional)])
                                    .await
                                    .map_err(execution_error);
                                let _ = resp.send(result);
                            }
                            ScriptCommand::Shutdown { resp } => {
                                let result = executor
                                    .call(
                                        "invoke",
                                        &[Value::String("shutdown".to_string()), Value::Array(vec![]), Value::Bool(true)],
                                    )
                                    .await
                                    .map(|_| ())
                                    .map_err(execution_error);
                                let _ = resp.send(result);
                                break;
                            }
                        }
                    }

                    info!(extension = %worker_id, "script worker stopped");
                });
            })
            .map_err(|e| ExtensionError::BackendLoadError(format!("failed to spawn script thread: {}", e)))?;

        let isolate = ready_rx.await.map_err(|_| {
            ExtensionError::BackendLoadError("script worker exited during startup".to_string())
        })??;

        Ok(Self {
            extension_id,
            tx,
            isolate,
            call_timeout: limits.max_call_time,
        })
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ScriptCommand,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| ExtensionError::InvalidState("script worker is not running".to_string()))?;

        match tokio::time::timeout(self.call_timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExtensionError::ExecutionError("script worker dropped the call".to_string())),
            Err(_) => {
                warn!(extension = %self.extension_id, "script call timed out, terminating execution");
                self.isolate.terminate_execution();
                Err(ExtensionError::Timeout(format!(
                    "script call exceeded {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl PluginBackend for ScriptBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Script
    }

    async fn initialize(&self, surface: Arc<HostSurface>) -> Result<()> {
        self.send(|resp| ScriptCommand::Initialize { surface, resp }).await
    }

    async fn invoke(&self, capability: Capability, args: Value) -> Result<Value> {
        let ordered = capability
            .params()
            .iter()
            .map(|p| args.get(p.name).cloned().unwrap_or(Value::Null))
            .collect();

        self.send(|resp| ScriptCommand::Invoke {
            name: capability.as_str().to_string(),
            args: ordered,
            optional: false,
            resp,
        })
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        let result = self.send(|resp| ScriptCommand::Shutdown { resp }).await;
        if let Err(e) = &result {
            error!(extension = %self.extension_id, "script shutdown hook failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::host::tests::surface;
    use crate::plugin::sandbox::Permission;
    use serde_json::json;

    fn manifest() -> Manifest {
        Manifest::from_value(json!({
            "id": "script-sample",
            "name": "Script Sample",
            "version": "1.0.0",
            "kind": "media-provider",
            "targetVersion": "0.4.0",
            "capabilities": { "search": true },
            "permissions": ["network", "storage", "logging"]
        }))
        .unwrap()
    }

    async fn backend(source: &str, permissions: Vec<Permission>) -> ScriptBackend {
        let backend = ScriptBackend::create(&manifest(), source.to_string(), &ResourceLimits::default())
            .await
            .unwrap();
        let surface = Arc::new(surface("script-sample", permissions, Some(vec!["example.com"])));
        backend.initialize(surface).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_search_through_exports() {
        let source = r#"
            exports.search = async (query, page) => ({
                results: [{ id: "1", title: `${query} #${page}` }],
                hasNextPage: false,
                currentPage: page,
            });
        "#;
        let backend = backend(source, vec![]).await;

        let result = backend
            .invoke(Capability::Search, json!({ "query": "naruto", "page": 2 }))
            .await
            .unwrap();
        assert_eq!(result["results"][0]["title"], "naruto #2");
        assert_eq!(result["currentPage"], 2);

        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ambient_names_are_shadowed() {
        let source = r#"
            exports.search = () => [typeof Deno, typeof globalThis, typeof fetch];
        "#;
        let backend = backend(source, vec![]).await;
        let result = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap();
        assert_eq!(result, json!(["undefined", "undefined", "undefined"]));
    }

    #[tokio::test]
    async fn test_recovered_global_has_no_ops() {
        let source = r#"
            exports.search = async () => {
                const viaFunction = Function("return this")();
                const viaEval = (0, eval)("this");
                const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
                const viaAsync = await AsyncFunction("return this")();
                return [
                    typeof viaFunction.Deno,
                    typeof viaEval.Deno,
                    typeof viaAsync.Deno,
                    Object.keys(viaFunction).filter((k) => k.startsWith("op_")),
                ];
            };
        "#;
        let backend = backend(source, vec![]).await;
        let result = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap();
        assert_eq!(result, json!(["undefined", "undefined", "undefined", []]));
    }

    #[tokio::test]
    async fn test_init_hook_and_storage() {
        let source = r#"
            exports.init = async () => { await storage.set("visits", 1); };
            exports.search = async () => {
                const visits = await storage.get("visits", 0);
                await storage.set("visits", visits + 1);
                return { visits: await storage.get("visits"), keys: await storage.keys() };
            };
        "#;
        let backend = backend(source, vec![Permission::Storage]).await;
        let result = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "visits": 2, "keys": ["visits"] }));
    }

    #[tokio::test]
    async fn test_http_refused_outside_allowlist() {
        let source = r#"
            exports.search = async () => {
                try {
                    await http.get("http://blocked.invalid/");
                    return "reached";
                } catch (e) {
                    return String(e.message);
                }
            };
        "#;
        let backend = backend(source, vec![Permission::Network]).await;
        let result = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("may not access host"));
    }

    #[tokio::test]
    async fn test_thrown_error_becomes_execution_error() {
        let backend = backend(r#"exports.search = () => { throw new Error("boom"); };"#, vec![]).await;
        let err = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::ExecutionError(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_missing_export() {
        let backend = backend("exports.other = () => 1;", vec![]).await;
        let err = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn test_syntax_error_fails_load() {
        let backend = ScriptBackend::create(&manifest(), "exports.search = (".to_string(), &ResourceLimits::default())
            .await
            .unwrap();
        let surface = Arc::new(surface("script-sample", vec![], None));
        let err = backend.initialize(surface).await.unwrap_err();
        assert!(matches!(err, ExtensionError::BackendLoadError(_)));
    }

    #[tokio::test]
    async fn test_runaway_script_times_out() {
        let limits = ResourceLimits::new(16 * 1024 * 1024, Duration::from_millis(200));
        let backend = ScriptBackend::create(&manifest(), "exports.search = () => { while (true) {} };".to_string(), &limits)
            .await
            .unwrap();
        backend
            .initialize(Arc::new(surface("script-sample", vec![], None)))
            .await
            .unwrap();

        let err = backend
            .invoke(Capability::Search, json!({ "query": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Timeout(_)));
    }
}
