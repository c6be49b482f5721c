//! Capability registry
//!
//! The fixed table of host-defined operations an extension may implement,
//! with the argument signature each one expects. The table is consulted by
//! the manifest validator (unknown names are rejected) and by the dispatcher
//! (calls outside an instance's advertised set are refused).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{ExtensionError, Result};

/// One named, host-defined operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "getPopular")]
    GetPopular,
    #[serde(rename = "getLatest")]
    GetLatest,
    #[serde(rename = "getEpisodes")]
    GetEpisodes,
    #[serde(rename = "getStreams")]
    GetStreams,
    #[serde(rename = "getAnimeDetails")]
    GetAnimeDetails,
    #[serde(rename = "extractStream")]
    ExtractStream,
    #[serde(rename = "getHosterInfo")]
    GetHosterInfo,
    #[serde(rename = "decryptStream")]
    DecryptStream,
    #[serde(rename = "getDownloadLink")]
    GetDownloadLink,
}

/// A single declared parameter of a capability
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    /// Default used when the caller omits the argument; `None` means required
    pub default: Option<fn() -> Value>,
}

const fn required(name: &'static str) -> Param {
    Param { name, default: None }
}

fn first_page() -> Value {
    json!(1)
}

const fn page() -> Param {
    Param { name: "page", default: Some(first_page) }
}

/// How long a successful result may be served from the extraction cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Search results, listings, details
    Listing,
    /// Stream lists and extracted stream URLs
    Stream,
    /// Static hoster metadata
    HosterInfo,
    /// Never cached
    Uncached,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Search,
        Capability::GetPopular,
        Capability::GetLatest,
        Capability::GetEpisodes,
        Capability::GetStreams,
        Capability::GetAnimeDetails,
        Capability::ExtractStream,
        Capability::GetHosterInfo,
        Capability::DecryptStream,
        Capability::GetDownloadLink,
    ];

    /// Wire name used in manifests, script exports and module exports
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::GetPopular => "getPopular",
            Capability::GetLatest => "getLatest",
            Capability::GetEpisodes => "getEpisodes",
            Capability::GetStreams => "getStreams",
            Capability::GetAnimeDetails => "getAnimeDetails",
            Capability::ExtractStream => "extractStream",
            Capability::GetHosterInfo => "getHosterInfo",
            Capability::DecryptStream => "decryptStream",
            Capability::GetDownloadLink => "getDownloadLink",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Ordered parameter list
    pub fn params(&self) -> &'static [Param] {
        const SEARCH: &[Param] = &[required("query"), page()];
        const LISTING: &[Param] = &[page()];
        const EPISODES: &[Param] = &[required("animeId"), page()];
        const STREAMS: &[Param] = &[required("animeId"), required("episodeId")];
        const DETAILS: &[Param] = &[required("animeId")];
        const URL: &[Param] = &[required("url")];
        const NONE: &[Param] = &[];
        const DATA: &[Param] = &[required("data")];

        match self {
            Capability::Search => SEARCH,
            Capability::GetPopular | Capability::GetLatest => LISTING,
            Capability::GetEpisodes => EPISODES,
            Capability::GetStreams => STREAMS,
            Capability::GetAnimeDetails => DETAILS,
            Capability::ExtractStream | Capability::GetDownloadLink => URL,
            Capability::GetHosterInfo => NONE,
            Capability::DecryptStream => DATA,
        }
    }

    /// Name of the result shape the capability returns
    pub fn returns(&self) -> &'static str {
        match self {
            Capability::Search | Capability::GetPopular | Capability::GetLatest => "SearchResult",
            Capability::GetEpisodes => "EpisodesResult",
            Capability::GetStreams => "StreamDescriptor[]",
            Capability::GetAnimeDetails => "MediaItem",
            Capability::ExtractStream => "StreamDescriptor?",
            Capability::GetHosterInfo => "HosterInfo[]",
            Capability::DecryptStream | Capability::GetDownloadLink => "string",
        }
    }

    pub fn cache_class(&self) -> CacheClass {
        match self {
            Capability::Search
            | Capability::GetPopular
            | Capability::GetLatest
            | Capability::GetEpisodes
            | Capability::GetAnimeDetails => CacheClass::Listing,
            Capability::GetStreams | Capability::ExtractStream => CacheClass::Stream,
            Capability::GetHosterInfo => CacheClass::HosterInfo,
            Capability::DecryptStream | Capability::GetDownloadLink => CacheClass::Uncached,
        }
    }

    /// Bit used in the native call table capability mask
    pub fn bit(&self) -> u32 {
        match self {
            Capability::Search => 1 << 0,
            Capability::GetPopular => 1 << 1,
            Capability::GetLatest => 1 << 2,
            Capability::GetEpisodes => 1 << 3,
            Capability::GetStreams => 1 << 4,
            Capability::GetAnimeDetails => 1 << 5,
            Capability::ExtractStream => 1 << 8,
            Capability::GetHosterInfo => 1 << 9,
            Capability::DecryptStream => 1 << 10,
            Capability::GetDownloadLink => 1 << 11,
        }
    }

    /// Check `args` against the signature.
    ///
    /// Returns the normalized argument object (defaults filled in) and the
    /// ordered argument tuple used as part of the cache key.
    pub fn bind_args(&self, args: &Value) -> Result<(Value, Vec<Value>)> {
        let empty = Map::new();
        let provided = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(ExtensionError::ValidationError(format!(
                    "arguments for '{}' must be an object, got {}",
                    self, other
                )))
            }
        };

        let mut normalized = provided.clone();
        let mut ordered = Vec::with_capacity(self.params().len());

        for param in self.params() {
            let value = match (provided.get(param.name), param.default) {
                (Some(v), _) if !v.is_null() => v.clone(),
                (_, Some(default)) => default(),
                _ => {
                    return Err(ExtensionError::ValidationError(format!(
                        "missing argument '{}' for capability '{}'",
                        param.name, self
                    )))
                }
            };
            normalized.insert(param.name.to_string(), value.clone());
            ordered.push(value);
        }

        Ok((Value::Object(normalized), ordered))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::from_name(s).ok_or_else(|| {
            ExtensionError::ValidationError(format!("unknown capability '{}'", s))
        })
    }
}

/// Per-class cache lifetimes
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub listing: Duration,
    pub stream: Duration,
    pub hoster_info: Duration,
}

impl CacheTtls {
    pub fn ttl_for(&self, capability: Capability) -> Option<Duration> {
        let ttl = match capability.cache_class() {
            CacheClass::Listing => self.listing,
            CacheClass::Stream => self.stream,
            CacheClass::HosterInfo => self.hoster_info,
            CacheClass::Uncached => return None,
        };
        (!ttl.is_zero()).then_some(ttl)
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(60 * 60),
            stream: Duration::from_secs(10 * 60),
            hoster_info: Duration::from_secs(24 * 60 * 60),
        }
    }
}
