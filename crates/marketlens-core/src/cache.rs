use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Sentinel payload marking a computation already running for this key.
/// Readers must treat it as "try again later", never as a miss.
pub const QUERY_CACHE_IN_PROGRESS: &str = "QUERY_CACHE_IN_PROGRESS";

/// String-blob cache with TTL semantics. The gate only needs get,
/// set-if-absent (for the placeholder claim) and remove.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl: Duration);
    /// Returns true when the key was absent and this call claimed it.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;
    fn remove(&self, key: &str);
}

/// Process-local cache with lazy expiry. Suitable for a single-node
/// deployment and for tests; a shared store can implement [`QueryCache`]
/// without touching the gate.
#[derive(Default)]
pub struct InMemoryQueryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueryCache for InMemoryQueryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        let live = matches!(entries.get(key), Some((_, expires)) if *expires > Instant::now());
        if live {
            return false;
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        true
    }

    fn remove(&self, key: &str) {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key);
    }
}

/// Stable fingerprint of a query payload: sha256 over the project id and
/// the query's canonical JSON.
pub fn query_fingerprint<T: Serialize>(project_id: &str, query: &T) -> Result<String> {
    let payload = serde_json::to_string(query)?;
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Tolerance for deciding a window "ends now".
const ROLLING_WINDOW_SLACK_SECS: i64 = 60;
const THIRTY_MIN_SECS: i64 = 30 * 60;
const TWO_MIN_SECS: i64 = 2 * 60;

/// Time-window component of the cache key. The two well-known rolling
/// dashboard windows collapse to fixed labels so repeated short-interval
/// refreshes share one entry; all other windows key on the literal bounds.
pub fn window_label(from: i64, to: i64, now: i64) -> String {
    let ends_now = (now - to).abs() <= ROLLING_WINDOW_SLACK_SECS;
    if ends_now && to - from == THIRTY_MIN_SECS {
        return "now-30min".to_string();
    }
    if ends_now && to - from == TWO_MIN_SECS {
        return "now-2min".to_string();
    }
    format!("{from}-{to}")
}

pub fn cache_key(fingerprint: &str, label: &str) -> String {
    format!("query:{fingerprint}:{label}")
}

/// Outcome of attempting to enter the cache gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit(String),
    /// Another request is computing this key; caller should retry later.
    InProgress,
    /// This caller claimed the key and must compute, then `finish` or
    /// `abort`.
    Miss,
}

/// Enter the gate for `key`. Advisory, not transactional: a lost race can
/// at worst duplicate computation, never corrupt data.
pub fn begin(cache: &dyn QueryCache, key: &str, placeholder_ttl: Duration) -> CacheOutcome {
    if let Some(value) = cache.get(key) {
        if value == QUERY_CACHE_IN_PROGRESS {
            return CacheOutcome::InProgress;
        }
        return CacheOutcome::Hit(value);
    }
    if cache.set_if_absent(key, QUERY_CACHE_IN_PROGRESS, placeholder_ttl) {
        CacheOutcome::Miss
    } else {
        CacheOutcome::InProgress
    }
}

/// Publish the computed payload, replacing the placeholder.
pub fn finish(cache: &dyn QueryCache, key: &str, payload: &str, ttl: Duration) {
    cache.set(key, payload, ttl);
}

/// Release the placeholder after a failed computation so the next caller
/// can retry immediately.
pub fn abort(cache: &dyn QueryCache, key: &str) {
    cache.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_label_collapses_rolling_windows() {
        let now = 1_700_000_000;
        assert_eq!(window_label(now - 1800, now, now), "now-30min");
        assert_eq!(window_label(now - 120, now, now), "now-2min");
        // Still a 30-minute window when it ends within the slack of now.
        assert_eq!(window_label(now - 1830, now - 30, now), "now-30min");
        // A shortened window is not the rolling one, whatever its end.
        assert_eq!(
            window_label(now - 1800, now - 30, now),
            format!("{}-{}", now - 1800, now - 30)
        );
        // A 30-minute window in the past keys on its literal bounds.
        let from = now - 7200;
        let to = from + 1800;
        assert_eq!(window_label(from, to, now), format!("{from}-{to}"));
    }

    #[test]
    fn test_fingerprint_stable_and_project_scoped() {
        #[derive(Serialize)]
        struct Q {
            event: String,
        }
        let q = Q {
            event: "sign_up".to_string(),
        };
        let a = query_fingerprint("proj_1", &q).unwrap();
        let b = query_fingerprint("proj_1", &q).unwrap();
        let c = query_fingerprint("proj_2", &q).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_gate_single_flight() {
        let cache = InMemoryQueryCache::new();
        let ttl = Duration::from_secs(30);

        let first = begin(&cache, "k", ttl);
        assert_eq!(first, CacheOutcome::Miss);
        let second = begin(&cache, "k", ttl);
        assert_eq!(second, CacheOutcome::InProgress);

        finish(&cache, "k", "{\"rows\":[]}", ttl);
        let third = begin(&cache, "k", ttl);
        assert_eq!(third, CacheOutcome::Hit("{\"rows\":[]}".to_string()));
    }

    #[test]
    fn test_gate_abort_releases_placeholder() {
        let cache = InMemoryQueryCache::new();
        let ttl = Duration::from_secs(30);
        assert_eq!(begin(&cache, "k", ttl), CacheOutcome::Miss);
        abort(&cache, "k");
        assert_eq!(begin(&cache, "k", ttl), CacheOutcome::Miss);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = InMemoryQueryCache::new();
        cache.set("k", "v", Duration::from_millis(0));
        assert_eq!(cache.get("k"), None);
        assert!(cache.set_if_absent("k", "w", Duration::from_secs(5)));
    }

    #[test]
    fn test_concurrent_begin_claims_once() {
        use std::sync::Arc;
        let cache = Arc::new(InMemoryQueryCache::new());
        let ttl = Duration::from_secs(30);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                begin(cache.as_ref(), "k", ttl)
            }));
        }
        let outcomes: Vec<CacheOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let misses = outcomes
            .iter()
            .filter(|o| matches!(o, CacheOutcome::Miss))
            .count();
        assert_eq!(misses, 1);
    }
}
