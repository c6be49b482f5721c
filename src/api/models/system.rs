use crate::cache::CacheStats;
use serde::Serialize;

/// Body of `GET /api/health`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub host_version: String,
    pub profile: String,
    pub extensions: usize,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub timestamp: i64,
}
