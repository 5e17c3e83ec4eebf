//! Cache backends and key derivation.
//!
//! The machine mediates `CacheGet`/`CachePut`/`CacheExists`/`CacheDelete`
//! against a [`CacheBackend`]. Two backends ship here: an in-memory map
//! for tests and short runs, and a write-through JSON file for
//! persistence across runs. Values round-trip through the lossy JSON
//! projection, so cached values should be data (numbers, strings, lists,
//! maps), not handles.

use doeff_core::cache::CacheBackend;
use doeff_core::errors::EffectError;
use doeff_core::values::Value;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Derive a deterministic cache key from ordered key material.
///
/// The key is the hex SHA-256 of the parts joined with a separator that
/// cannot appear inside JSON-encoded parts, so distinct part lists never
/// collide.
pub fn cache_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Rebuild a `Value` from its JSON projection.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Unit,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Unit),
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        Json::Object(entries) => Value::Map(
            entries.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

/// Process-local cache backed by a map. Values are stored as-is.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, EffectError> {
        Ok(self.entries.lock().ok().and_then(|e| e.get(key).cloned()))
    }

    fn put(&self, key: &str, value: Value) -> Result<(), EffectError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, EffectError> {
        Ok(self.entries.lock().map(|e| e.contains_key(key)).unwrap_or(false))
    }

    fn delete(&self, key: &str) -> Result<bool, EffectError> {
        Ok(self
            .entries
            .lock()
            .map(|mut e| e.remove(key).is_some())
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// JsonFileCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: serde_json::Value,
    created_at: DateTime<Utc>,
    ttl_secs: Option<u64>,
}

impl FileEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            None => false,
            Some(ttl) => now - self.created_at > Duration::seconds(ttl as i64),
        }
    }
}

/// Persistent key-value cache backed by a single JSON file.
///
/// The file is loaded on construction and rewritten on every mutation
/// (write-through). Entries can carry a TTL; expired entries behave as
/// misses and are pruned on access.
pub struct JsonFileCache {
    path: PathBuf,
    ttl_secs: Option<u64>,
    entries: Mutex<HashMap<String, FileEntry>>,
}

impl JsonFileCache {
    /// Create or load a cache at `path` with no expiry.
    pub fn new(path: PathBuf) -> Self {
        Self::with_ttl(path, None)
    }

    /// Create or load a cache whose new entries expire after `ttl_secs`.
    pub fn with_ttl(path: PathBuf, ttl_secs: Option<u64>) -> Self {
        let entries = Self::load(&path).unwrap_or_default();
        Self { path, ttl_secs, entries: Mutex::new(entries) }
    }

    fn load(path: &PathBuf) -> Option<HashMap<String, FileEntry>> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn flush(&self, entries: &HashMap<String, FileEntry>) -> Result<(), EffectError> {
        let text = serde_json::to_string_pretty(entries).map_err(|e| {
            EffectError::CacheCorrupt {
                key: String::new(),
                message: format!("encode failed: {}", e),
            }
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(&self.path, text).map_err(|e| EffectError::CacheCorrupt {
            key: String::new(),
            message: format!("write failed: {}", e),
        })
    }
}

impl CacheBackend for JsonFileCache {
    fn get(&self, key: &str) -> Result<Option<Value>, EffectError> {
        let mut entries = self.entries.lock().map_err(|_| EffectError::CacheCorrupt {
            key: key.to_string(),
            message: "cache lock poisoned".to_string(),
        })?;
        match entries.get(key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(Utc::now()) => {
                entries.remove(key);
                let snapshot = entries.clone();
                drop(entries);
                self.flush(&snapshot)?;
                Ok(None)
            }
            Some(entry) => Ok(Some(json_to_value(&entry.value))),
        }
    }

    fn put(&self, key: &str, value: Value) -> Result<(), EffectError> {
        let mut entries = self.entries.lock().map_err(|_| EffectError::CacheCorrupt {
            key: key.to_string(),
            message: "cache lock poisoned".to_string(),
        })?;
        entries.insert(
            key.to_string(),
            FileEntry {
                value: value.to_json(),
                created_at: Utc::now(),
                ttl_secs: self.ttl_secs,
            },
        );
        let snapshot = entries.clone();
        drop(entries);
        self.flush(&snapshot)
    }

    fn exists(&self, key: &str) -> Result<bool, EffectError> {
        Ok(self
            .entries
            .lock()
            .map(|e| e.get(key).map(|entry| !entry.is_expired(Utc::now())).unwrap_or(false))
            .unwrap_or(false))
    }

    fn delete(&self, key: &str) -> Result<bool, EffectError> {
        let mut entries = self.entries.lock().map_err(|_| EffectError::CacheCorrupt {
            key: key.to_string(),
            message: "cache lock poisoned".to_string(),
        })?;
        let removed = entries.remove(key).is_some();
        if removed {
            let snapshot = entries.clone();
            drop(entries);
            self.flush(&snapshot)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("doeff_cache_tests");
        fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}.json", name))
    }

    fn cleanup(path: &PathBuf) {
        let _ = fs::remove_file(path);
    }

    #[test]
    fn cache_key_is_deterministic_and_injective_on_parts() {
        let a = cache_key(["llm", "prompt-1"]);
        let b = cache_key(["llm", "prompt-1"]);
        let c = cache_key(["llm", "prompt-2"]);
        let d = cache_key(["llmprompt-1"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").unwrap().is_none());
        cache.put("k", Value::Int(5)).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(Value::Int(5)));
        assert!(cache.exists("k").unwrap());
        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
    }

    #[test]
    fn file_cache_persists_across_instances() {
        let path = temp_cache_path("persist");
        cleanup(&path);
        {
            let cache = JsonFileCache::new(path.clone());
            cache.put("alpha", Value::Str("A".into())).unwrap();
            cache.put("n", Value::Int(3)).unwrap();
        }
        let cache2 = JsonFileCache::new(path.clone());
        assert_eq!(cache2.get("alpha").unwrap(), Some(Value::Str("A".into())));
        assert_eq!(cache2.get("n").unwrap(), Some(Value::Int(3)));
        cleanup(&path);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let path = temp_cache_path("ttl");
        cleanup(&path);
        let cache = JsonFileCache::with_ttl(path.clone(), Some(0));
        cache.put("k", Value::Int(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(cache.get("k").unwrap(), None);
        cleanup(&path);
    }
}
