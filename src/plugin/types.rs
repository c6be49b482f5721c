//! Plugin type definitions
//!
//! This module defines the backend contract every extension format implements,
//! the instance lifecycle, and the data shapes extensions return.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::capability::Capability;
use super::host::HostSurface;
use crate::core::error::Result;

/// Unique identifier of a loaded extension
pub type ExtensionId = String;

/// Uniform contract over script, module, native and builtin extensions.
///
/// Adapters are created by their own `create` constructors from a manifest and
/// locator; after that the dispatcher only talks to them through this trait.
/// Every method normalizes its failures to `ExtensionError`.
#[async_trait::async_trait]
pub trait PluginBackend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Wire the instance to its host surface and run the extension's init hook
    async fn initialize(&self, surface: Arc<HostSurface>) -> Result<()>;

    /// Run one capability with normalized arguments
    async fn invoke(&self, capability: Capability, args: Value) -> Result<Value>;

    /// Run the extension's shutdown hook and release the backend
    async fn shutdown(&self) -> Result<()>;

    /// Whether a successful result for these arguments may be reused
    fn is_cacheable(&self, _capability: Capability, _args: &Value) -> bool {
        true
    }
}

/// Extension format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Script evaluated in an isolated JavaScript runtime
    Script,
    /// Linear-memory binary module
    Module,
    /// Native shared library
    Native,
    /// Compiled into the host
    Builtin,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Script => write!(f, "script"),
            BackendType::Module => write!(f, "module"),
            BackendType::Native => write!(f, "native"),
            BackendType::Builtin => write!(f, "builtin"),
        }
    }
}

/// Instance lifecycle: `Unloaded → Initializing → Ready → ShuttingDown → Unloaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Unloaded,
    Initializing,
    Ready,
    ShuttingDown,
}

impl InstanceState {
    pub fn as_u8(self) -> u8 {
        match self {
            InstanceState::Unloaded => 0,
            InstanceState::Initializing => 1,
            InstanceState::Ready => 2,
            InstanceState::ShuttingDown => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => InstanceState::Initializing,
            2 => InstanceState::Ready,
            3 => InstanceState::ShuttingDown,
            _ => InstanceState::Unloaded,
        }
    }
}

/// Stream container or delivery format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[serde(alias = "m3u8")]
    Hls,
    Mp4,
    #[serde(alias = "matroska")]
    Mkv,
    Webm,
    Dash,
    Torrent,
    Embed,
}

impl StreamFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hls" | "m3u8" => Some(StreamFormat::Hls),
            "mp4" => Some(StreamFormat::Mp4),
            "mkv" | "matroska" => Some(StreamFormat::Mkv),
            "webm" => Some(StreamFormat::Webm),
            "dash" | "mpd" => Some(StreamFormat::Dash),
            "torrent" | "magnet" => Some(StreamFormat::Torrent),
            "embed" => Some(StreamFormat::Embed),
            _ => None,
        }
    }

    /// Guess the format from a URL path
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("magnet:") {
            return StreamFormat::Torrent;
        }
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.contains(".m3u8") {
            StreamFormat::Hls
        } else if path.ends_with(".mpd") {
            StreamFormat::Dash
        } else if path.ends_with(".mkv") {
            StreamFormat::Mkv
        } else if path.ends_with(".webm") {
            StreamFormat::Webm
        } else if path.ends_with(".torrent") {
            StreamFormat::Torrent
        } else if path.ends_with(".mp4") || path.contains(".mp4") {
            StreamFormat::Mp4
        } else {
            StreamFormat::Embed
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamFormat::Hls => "hls",
            StreamFormat::Mp4 => "mp4",
            StreamFormat::Mkv => "mkv",
            StreamFormat::Webm => "webm",
            StreamFormat::Dash => "dash",
            StreamFormat::Torrent => "torrent",
            StreamFormat::Embed => "embed",
        };
        f.write_str(name)
    }
}

/// A playable stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub url: String,
    pub format: StreamFormat,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    /// Headers the player must send (Referer, cookies)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub is_default: bool,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            format: StreamFormat::from_url(&url),
            url,
            quality: None,
            server: None,
            headers: BTreeMap::new(),
            is_default: false,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A catalogue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub alt_titles: Vec<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default)]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub number: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub air_date: Option<String>,
    #[serde(default)]
    pub is_filler: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub results: Vec<MediaItem>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default)]
    pub total_results: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodesResult {
    pub episodes: Vec<Episode>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default)]
    pub total_episodes: Option<u32>,
}

fn first_page() -> u32 {
    1
}

/// Metadata for one supported hoster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HosterInfo {
    pub name: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Call statistics for one instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cache_hits: u64,
    pub avg_execution_time_ms: Option<f64>,
    pub max_execution_time_ms: Option<u64>,
    pub last_call_timestamp: Option<i64>,
    pub last_error: Option<String>,
    /// Error type -> count
    pub error_distribution: HashMap<String, u64>,
    #[serde(skip)]
    recent_times: VecDeque<u64>,
}

impl ExtensionStats {
    const MAX_RECENT: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, execution_time_ms: u64) {
        self.total_calls += 1;
        self.successful_calls += 1;
        self.last_call_timestamp = Some(chrono::Utc::now().timestamp());

        let count = self.successful_calls as f64;
        let avg = self.avg_execution_time_ms.unwrap_or(0.0);
        self.avg_execution_time_ms = Some((avg * (count - 1.0) + execution_time_ms as f64) / count);
        self.max_execution_time_ms = Some(
            self.max_execution_time_ms
                .map(|max| max.max(execution_time_ms))
                .unwrap_or(execution_time_ms),
        );

        if self.recent_times.len() >= Self::MAX_RECENT {
            self.recent_times.pop_front();
        }
        self.recent_times.push_back(execution_time_ms);
    }

    pub fn record_failure(&mut self, error_type: &str, message: &str) {
        self.total_calls += 1;
        self.failed_calls += 1;
        self.last_call_timestamp = Some(chrono::Utc::now().timestamp());
        self.last_error = Some(message.to_string());
        *self.error_distribution.entry(error_type.to_string()).or_insert(0) += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    /// Success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        (self.successful_calls as f64 / self.total_calls as f64) * 100.0
    }

    /// Median of the most recent successful call times
    pub fn recent_median_ms(&self) -> Option<u64> {
        if self.recent_times.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.recent_times.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_format_aliases() {
        let format: StreamFormat = serde_json::from_value(json!("m3u8")).unwrap();
        assert_eq!(format, StreamFormat::Hls);
        let format: StreamFormat = serde_json::from_value(json!("matroska")).unwrap();
        assert_eq!(format, StreamFormat::Mkv);
        assert_eq!(serde_json::to_value(StreamFormat::Hls).unwrap(), json!("hls"));
    }

    #[test]
    fn test_stream_format_from_url() {
        assert_eq!(StreamFormat::from_url("https://cdn.x/v/master.m3u8?t=1"), StreamFormat::Hls);
        assert_eq!(StreamFormat::from_url("https://cdn.x/v/file.mp4"), StreamFormat::Mp4);
        assert_eq!(StreamFormat::from_url("https://cdn.x/manifest.mpd"), StreamFormat::Dash);
        assert_eq!(StreamFormat::from_url("magnet:?xt=urn:btih:abc"), StreamFormat::Torrent);
        assert_eq!(StreamFormat::from_url("https://host.x/e/abc"), StreamFormat::Embed);
    }

    #[test]
    fn test_search_result_defaults() {
        let result: SearchResult = serde_json::from_value(json!({
            "results": [{ "id": "a-1", "title": "Frieren" }]
        }))
        .unwrap();
        assert_eq!(result.current_page, 1);
        assert!(!result.has_next_page);
        assert_eq!(result.results[0].title, "Frieren");
    }

    #[test]
    fn test_stats() {
        let mut stats = ExtensionStats::new();
        stats.record_success(100);
        stats.record_success(200);
        stats.record_failure("NetworkError", "connection refused");

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 2);
        assert_eq!(stats.avg_execution_time_ms, Some(150.0));
        assert_eq!(stats.max_execution_time_ms, Some(200));
        assert_eq!(stats.error_distribution.get("NetworkError"), Some(&1));
        assert_eq!(stats.last_error.as_deref(), Some("connection refused"));
        assert!((stats.success_rate() - 66.666).abs() < 0.01);
        assert_eq!(stats.recent_median_ms(), Some(200));
    }

    #[test]
    fn test_instance_state_encoding() {
        for state in [
            InstanceState::Unloaded,
            InstanceState::Initializing,
            InstanceState::Ready,
            InstanceState::ShuttingDown,
        ] {
            assert_eq!(InstanceState::from_u8(state.as_u8()), state);
        }
    }
}
