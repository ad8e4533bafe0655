//! Engine-side cache volumes
//!
//! Persistent cache mounts are backed by named podman volumes. Raw keys can
//! contain any character, so volume names use a digest of the key and the
//! key itself is kept in a label.

use crate::llb::CacheSharing;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Volume label keys used to track cache metadata
pub mod labels {
    /// Marks volume as a dalec cache
    pub const DALEC_CACHE: &str = "io.dalec.cache";
    /// The unhashed cache key
    pub const KEY: &str = "io.dalec.cache.key";
    pub const SHARING: &str = "io.dalec.cache.sharing";
    /// Creation timestamp (RFC3339)
    pub const CREATED_AT: &str = "io.dalec.cache.created_at";
}

/// A persistent cache volume
#[derive(Debug, Clone)]
pub struct CacheVolume {
    /// Volume name (`{prefix}{sha256(key)[..16]}`)
    pub name: String,
    pub key: String,
    pub sharing: CacheSharing,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
}

impl CacheVolume {
    /// Volume record for a cache key
    pub fn for_key(prefix: &str, key: &str, sharing: CacheSharing) -> Self {
        Self {
            name: Self::volume_name(prefix, key),
            key: key.to_string(),
            sharing,
            created_at: Utc::now(),
            size_bytes: None,
        }
    }

    pub fn volume_name(prefix: &str, key: &str) -> String {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        format!("{}{}", prefix, &digest[..16])
    }

    /// Generate labels for volume creation
    pub fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(labels::DALEC_CACHE.to_string(), "true".to_string());
        labels.insert(labels::KEY.to_string(), self.key.clone());
        labels.insert(labels::SHARING.to_string(), self.sharing.to_string());
        labels.insert(labels::CREATED_AT.to_string(), self.created_at.to_rfc3339());
        labels
    }

    /// Try to parse from volume labels
    pub fn from_labels(name: &str, labels: &HashMap<String, String>) -> Option<Self> {
        if labels.get(labels::DALEC_CACHE).map(String::as_str) != Some("true") {
            return None;
        }

        let key = labels.get(labels::KEY)?.clone();
        let sharing = match labels.get(labels::SHARING).map(String::as_str) {
            Some("locked") => CacheSharing::Locked,
            Some("private") => CacheSharing::Private,
            _ => CacheSharing::Shared,
        };
        let created_at = labels
            .get(labels::CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Self {
            name: name.to_string(),
            key,
            sharing,
            created_at,
            size_bytes: None,
        })
    }
}
