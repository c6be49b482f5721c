//! Extension runtime
//!
//! This module provides the extension system:
//! - Capability registry and manifest validation
//! - Version compatibility checks
//! - Host capability surface (sandbox, HTTP, storage, logging)
//! - Backend adapters for script, WASM module and native library extensions
//! - `.zpe` packages and the built-in hoster extension
//! - Extension manager for loading, unloading and dispatch

pub mod builtin;
pub mod capability;
pub mod host;
pub mod js_runtime;
pub mod logger;
pub mod manager;
pub mod manifest;
pub mod native;
pub mod package;
pub mod runtime;
pub mod sandbox;
pub mod storage;
pub mod types;
pub mod version;

pub use builtin::{BuiltinHosterBackend, BUILTIN_ID};
pub use capability::{CacheTtls, Capability};
pub use host::{HostSurface, HttpRequest, HttpResponse};
pub use js_runtime::ScriptBackend;
pub use manager::{ExtensionManager, InstanceSummary, RestoreReport, SearchOutcome, StreamResolution};
pub use manifest::{ExtensionKind, Locator, Manifest, ValidationResult};
pub use native::NativeBackend;
pub use package::ExtensionPackage;
pub use runtime::ModuleBackend;
pub use sandbox::{Permission, ResourceLimits, Sandbox};
pub use storage::{ExtensionStorage, KvStore, MemoryKvStore};
pub use types::{
    BackendType, Episode, EpisodesResult, ExtensionId, ExtensionStats, HosterInfo, InstanceState, MediaItem,
    PluginBackend, SearchResult, StreamDescriptor, StreamFormat,
};
pub use version::{CompatibilityReport, CompatibilityStatus, HOST_VERSION};
