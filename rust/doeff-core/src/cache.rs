//! Pluggable cache backend contract for the cache effect family.

use crate::errors::EffectError;
use crate::values::Value;

/// Storage backing `CacheGet` / `CachePut` / `CacheExists` / `CacheDelete`.
///
/// The machine only mediates: key derivation belongs to the caller, and
/// determinism (same key, same value) is the backend's obligation. Under
/// the single-threaded scheduler at most one build per key can be in
/// flight, so backends need no cross-key locking of their own.
pub trait CacheBackend: Send + Sync {
    /// Fetch a value. `Ok(None)` is a miss.
    fn get(&self, key: &str) -> Result<Option<Value>, EffectError>;

    fn put(&self, key: &str, value: Value) -> Result<(), EffectError>;

    fn exists(&self, key: &str) -> Result<bool, EffectError>;

    /// Remove a key; yields whether it was present.
    fn delete(&self, key: &str) -> Result<bool, EffectError>;
}
