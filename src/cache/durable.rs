//! Durable keyed record cache with per-entry TTL classes.
//!
//! Each store is a JSON object `key -> {payload, fetched_at, ttl_class}`
//! held in memory and, when a directory is configured, mirrored to disk.
//! Stale entries are invisible to readers but stay on disk until an
//! explicit sweep removes them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{MatchDetail, PlayerProfile};

const MATCHES_FILE: &str = "matches.json";
const PROFILES_FILE: &str = "profiles.json";

/// Freshness class chosen at write time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    /// Data that changes between sessions, e.g. rank.
    Volatile,
    /// Immutable once written, e.g. a finished match.
    #[default]
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub volatile: Duration,
    pub stable: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            volatile: Duration::from_secs(60 * 60),
            stable: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl TtlPolicy {
    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Volatile => self.volatile,
            TtlClass::Stable => self.stable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry<T> {
    payload: T,
    fetched_at: DateTime<Utc>,
    #[serde(default)]
    ttl_class: TtlClass,
}

impl<T> StoredEntry<T> {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        // Entries stamped in the future count as brand new.
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Result of a batch read.
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    pub hits: HashMap<String, T>,
    /// Keys without a fresh entry, in request order.
    pub misses: Vec<String>,
}

impl<T> CacheLookup<T> {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits.len() + self.misses.len();
        if total == 0 {
            0.0
        } else {
            self.hits.len() as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub fresh: usize,
    pub disk_bytes: u64,
}

/// One keyed store, optionally backed by a JSON file.
pub struct RecordStore<T> {
    name: &'static str,
    path: Option<PathBuf>,
    ttl: TtlPolicy,
    entries: RwLock<HashMap<String, StoredEntry<T>>>,
}

impl<T> RecordStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn in_memory(name: &'static str, ttl: TtlPolicy) -> Self {
        Self {
            name,
            path: None,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Load a store from `path`. A missing file starts empty; a corrupt file
    /// or entry is logged and skipped.
    pub async fn open(name: &'static str, path: PathBuf, ttl: TtlPolicy) -> Self {
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Self::decode(name, &path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("Cannot read {} cache {}: {}", name, path.display(), e);
                HashMap::new()
            }
        };

        debug!("Loaded {} {} cache entries", entries.len(), name);
        Self {
            name,
            path: Some(path),
            ttl,
            entries: RwLock::new(entries),
        }
    }

    fn decode(name: &str, path: &Path, content: &str) -> HashMap<String, StoredEntry<T>> {
        let raw: HashMap<String, serde_json::Value> = match serde_json::from_str(content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "Corrupt {} cache {}, starting empty: {}",
                    name,
                    path.display(),
                    e
                );
                return HashMap::new();
            }
        };

        raw.into_iter()
            .filter_map(
                |(key, value)| match serde_json::from_value::<StoredEntry<T>>(value) {
                    Ok(entry) => Some((key, entry)),
                    Err(e) => {
                        warn!("Skipping unreadable {} cache entry {}: {}", name, key, e);
                        None
                    }
                },
            )
            .collect()
    }

    /// Split `keys` into fresh hits and misses. Never touches the network or
    /// the disk.
    pub async fn get_many(&self, keys: &[String]) -> CacheLookup<T> {
        let entries = self.entries.read().await;
        let now = Utc::now();

        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for key in keys {
            match entries.get(key) {
                Some(entry) if entry.age(now) < self.ttl.ttl(entry.ttl_class) => {
                    hits.insert(key.clone(), entry.payload.clone());
                }
                _ => misses.push(key.clone()),
            }
        }

        CacheLookup { hits, misses }
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.get_many(&[key.to_string()]).await.hits.remove(key)
    }

    /// Insert or overwrite entries, stamped now.
    pub async fn put_many(&self, records: Vec<(String, T)>, class: TtlClass) -> Result<()> {
        self.put_many_at(records, class, Utc::now()).await
    }

    pub(crate) async fn put_many_at(
        &self,
        records: Vec<(String, T)>,
        class: TtlClass,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut entries = self.entries.write().await;
        for (key, payload) in records {
            entries.insert(
                key,
                StoredEntry {
                    payload,
                    fetched_at,
                    ttl_class: class,
                },
            );
        }
        self.persist(&entries).await
    }

    /// Delete entries older than `max_age`, regardless of class.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.age(now) < max_age);
        let removed = before - entries.len();

        if removed > 0 {
            self.persist(&entries).await?;
            info!("Swept {} stale {} cache entries", removed, self.name);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> StoreStats {
        let entries = self.entries.read().await;
        let now = Utc::now();
        let fresh = entries
            .values()
            .filter(|entry| entry.age(now) < self.ttl.ttl(entry.ttl_class))
            .count();

        let disk_bytes = match &self.path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
            None => 0,
        };

        StoreStats {
            total: entries.len(),
            fresh,
            disk_bytes,
        }
    }

    /// Rewrite the backing file via a temp file and rename.
    async fn persist(&self, entries: &HashMap<String, StoredEntry<T>>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let body = serde_json::to_vec(entries)
            .with_context(|| format!("Failed to serialize {} cache", self.name))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub matches: StoreStats,
    pub profiles: StoreStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub matches: usize,
    pub profiles: usize,
}

/// The two process-wide stores.
pub struct RecordCache {
    pub matches: RecordStore<MatchDetail>,
    pub profiles: RecordStore<PlayerProfile>,
}

impl RecordCache {
    pub fn in_memory(ttl: TtlPolicy) -> Self {
        Self {
            matches: RecordStore::in_memory("match", ttl),
            profiles: RecordStore::in_memory("profile", ttl),
        }
    }

    /// Open both stores under `dir`, creating it if needed.
    pub async fn open(dir: &Path, ttl: TtlPolicy) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        Ok(Self {
            matches: RecordStore::open("match", dir.join(MATCHES_FILE), ttl).await,
            profiles: RecordStore::open("profile", dir.join(PROFILES_FILE), ttl).await,
        })
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            matches: self.matches.stats().await,
            profiles: self.profiles.stats().await,
        }
    }

    pub async fn sweep_stale(&self, max_age: Duration) -> Result<SweepSummary> {
        Ok(SweepSummary {
            matches: self.matches.sweep_stale(max_age).await?,
            profiles: self.profiles.sweep_stale(max_age).await?,
        })
    }
}
