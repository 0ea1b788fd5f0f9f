//! # Offkit Cache
//!
//! Generational precache store for the offkit offline worker runtime.
//!
//! ## Features
//!
//! - **Generations**: named, versioned snapshots of precached resources
//! - **Atomic precache**: `add_all()` commits every manifest entry or none
//! - **Lookup**: per-generation or storage-wide request matching
//! - **Snapshots**: JSON save/load so a store survives process restarts
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     ├── Cache "app-v1"  (current generation)
//!     │       └── RequestKey → CacheEntry
//!     └── Cache "app-v0"  (stale, deleted at activate)
//! ```
//!
//! Exactly one generation is current at a time; the lifecycle controller in
//! offkit-sw decides which, this crate only stores them.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use offkit_common::{FetchRequest, NetworkResponse};
use offkit_net::NetworkAgent;

// ==================== Errors ====================

/// Cache store errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying storage unavailable or corrupted.
    #[error("Storage fault: {0}")]
    Storage(String),

    /// A manifest resource failed to fetch during precache.
    #[error("Precache failed for {url}: {reason}")]
    Precache { url: String, reason: String },
}

// ==================== Request Key ====================

/// Request identity within a generation: method plus URL.
///
/// Fragments are stripped before keying since they never reach the network;
/// the query string is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    /// Request method (uppercase).
    pub method: String,

    /// Fragment-free absolute URL.
    pub url: String,
}

impl RequestKey {
    /// Key a GET request for the given URL.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }

    /// Key an arbitrary request.
    pub fn for_request(request: &FetchRequest) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            method: request.method.to_uppercase(),
            url: url.into(),
        }
    }

    /// Canonical form used as the storage key.
    pub fn canonical(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

// ==================== Cache Entry ====================

/// A stored response. Immutable once written; a `put` with the same key in
/// the same generation replaces the prior value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status.
    pub status: u16,

    /// Status reason phrase.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Store time (ms since epoch).
    pub stored_at: u64,
}

impl CacheEntry {
    /// Capture a network response verbatim.
    pub fn from_network(response: &NetworkResponse) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: epoch_millis(),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ==================== Cache (one generation) ====================

/// One cache generation: a named map of request identity to stored response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Generation name.
    pub name: String,

    /// Entries keyed by canonical request identity.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a stored response.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(&key.canonical())
    }

    /// Store a response, replacing any prior value for the key.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) {
        self.entries.insert(key.canonical(), entry);
    }

    /// Remove an entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(&key.canonical()).is_some()
    }

    /// Canonical keys of all entries.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch every URL and store the responses, all or nothing.
    ///
    /// A non-success status or a network failure on any resource fails the
    /// whole operation and commits no entries; a fully usable offline set is
    /// the only success.
    pub async fn add_all(
        &mut self,
        agent: &dyn NetworkAgent,
        urls: &[Url],
    ) -> Result<(), CacheError> {
        let mut staged = Vec::with_capacity(urls.len());

        for url in urls {
            let request = FetchRequest::get(url.clone());
            let response = agent.fetch(&request).await.map_err(|e| {
                warn!(generation = %self.name, url = %url, error = %e, "precache fetch failed");
                CacheError::Precache {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

            if !response.is_success() {
                warn!(generation = %self.name, url = %url, status = response.status, "precache got non-success status");
                return Err(CacheError::Precache {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }

            debug!(generation = %self.name, url = %url, bytes = response.body.len(), "precached resource");
            staged.push((RequestKey::get(url), CacheEntry::from_network(&response)));
        }

        // Every fetch succeeded; commit.
        for (key, entry) in staged {
            self.put(key, entry);
        }

        info!(generation = %self.name, resources = urls.len(), "precache complete");
        Ok(())
    }
}

// ==================== Cache Storage ====================

/// All stored generations.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a generation without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check whether a generation exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a generation and all its entries. Deleting an absent
    /// generation is a no-op.
    pub fn delete(&mut self, name: &str) -> bool {
        let existed = self.caches.remove(name).is_some();
        if existed {
            info!(generation = %name, "deleted cache generation");
        }
        existed
    }

    /// Names of all stored generations.
    pub fn generation_names(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// Match a request across all generations, first match wins.
    ///
    /// Which generation wins when two store the same key is unspecified;
    /// callers that care must scope lookups to one generation via [`get`].
    ///
    /// [`get`]: CacheStorage::get
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(key))
    }

    /// Write a JSON snapshot of every generation.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), CacheError> {
        let json =
            serde_json::to_vec(self).map_err(|e| CacheError::Storage(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        debug!(path = %path.display(), "cache snapshot written");
        Ok(())
    }

    /// Load a snapshot. A missing file yields empty storage; a corrupted
    /// one is a storage fault.
    pub async fn load_snapshot(path: &Path) -> Result<Self, CacheError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(CacheError::Storage(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offkit_net::StaticAgent;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(body: &str) -> CacheEntry {
        CacheEntry::from_network(&NetworkResponse::ok_with_body(body.as_bytes().to_vec()))
    }

    #[test]
    fn test_request_key_strips_fragment() {
        let a = RequestKey::get(&url("https://app.example/page#top"));
        let b = RequestKey::get(&url("https://app.example/page"));
        assert_eq!(a, b);

        let c = RequestKey::get(&url("https://app.example/page?tab=1"));
        assert_ne!(b, c);
    }

    #[test]
    fn test_put_replaces_prior_value() {
        let mut cache = Cache::new("v1");
        let key = RequestKey::get(&url("https://app.example/index.html"));

        cache.put(key.clone(), entry("old"));
        cache.put(key.clone(), entry("new"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_request(&key).unwrap().body, b"new");
    }

    #[test]
    fn test_entry_delete() {
        let mut cache = Cache::new("v1");
        let key = RequestKey::get(&url("https://app.example/app.css"));
        cache.put(key.clone(), entry("body{}"));

        assert!(cache.delete(&key));
        assert!(!cache.delete(&key));
        assert!(cache.match_request(&key).is_none());
    }

    #[test]
    fn test_storage_open_and_delete_idempotent() {
        let mut storage = CacheStorage::new();
        storage.open("v1");
        assert!(storage.has("v1"));

        assert!(storage.delete("v1"));
        assert!(!storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[test]
    fn test_storage_wide_match() {
        let mut storage = CacheStorage::new();
        let key = RequestKey::get(&url("https://app.example/app.js"));
        storage.open("v0").put(key.clone(), entry("code"));

        assert!(storage.match_request(&key).is_some());
        assert!(storage.get("v1").is_none());
    }

    #[tokio::test]
    async fn test_add_all_stores_everything() {
        let agent = StaticAgent::new();
        agent.route_ok(&url("https://app.example/index.html"), "<html>").await;
        agent.route_ok(&url("https://app.example/offline.html"), "offline").await;

        let mut cache = Cache::new("v1");
        cache
            .add_all(
                &agent,
                &[
                    url("https://app.example/index.html"),
                    url("https://app.example/offline.html"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        let key = RequestKey::get(&url("https://app.example/index.html"));
        assert_eq!(cache.match_request(&key).unwrap().body, b"<html>");
    }

    #[tokio::test]
    async fn test_add_all_is_atomic_on_missing_resource() {
        let agent = StaticAgent::new();
        agent.route_ok(&url("https://app.example/index.html"), "<html>").await;
        // /gone.css is unrouted and will 404

        let mut cache = Cache::new("v1");
        let result = cache
            .add_all(
                &agent,
                &[
                    url("https://app.example/index.html"),
                    url("https://app.example/gone.css"),
                ],
            )
            .await;

        assert!(matches!(result, Err(CacheError::Precache { .. })));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_add_all_is_atomic_when_offline() {
        let agent = StaticAgent::new();
        agent.route_ok(&url("https://app.example/index.html"), "<html>").await;
        agent.set_offline(true);

        let mut cache = Cache::new("v1");
        let result = cache
            .add_all(&agent, &[url("https://app.example/index.html")])
            .await;

        assert!(matches!(result, Err(CacheError::Precache { .. })));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_add_all_twice_is_idempotent() {
        let agent = StaticAgent::new();
        agent.route_ok(&url("https://app.example/index.html"), "<html>").await;

        let mut cache = Cache::new("v1");
        let urls = [url("https://app.example/index.html")];
        cache.add_all(&agent, &urls).await.unwrap();
        cache.add_all(&agent, &urls).await.unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let mut storage = CacheStorage::new();
        let key = RequestKey::get(&url("https://app.example/index.html"));
        storage.open("v1").put(key.clone(), entry("<html>"));

        let path = std::env::temp_dir().join(format!("offkit-snap-{}.json", std::process::id()));
        storage.save_snapshot(&path).await.unwrap();

        let restored = CacheStorage::load_snapshot(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(restored.generation_names(), vec!["v1".to_string()]);
        assert_eq!(
            restored.get("v1").unwrap().match_request(&key).unwrap().body,
            b"<html>"
        );
    }

    #[tokio::test]
    async fn test_snapshot_missing_file_is_empty() {
        let path = std::env::temp_dir().join("offkit-snap-does-not-exist.json");
        let storage = CacheStorage::load_snapshot(&path).await.unwrap();
        assert!(storage.generation_names().is_empty());
    }
}
