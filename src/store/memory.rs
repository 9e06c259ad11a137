//! In-process implementation of [`AtomicStore`].
//!
//! Every call runs under a single mutex, which makes the scripted operations
//! trivially atomic. Expiry is evaluated lazily against the injected clock,
//! so tests can step over TTLs with a [`ManualClock`](crate::clock::ManualClock).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{
    ttl_millis, AtomicStore, StoreError, StoreResult, Swap, WindowOutcome, WindowRequest,
};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// (score, member) pairs kept in score order.
    ZSet(BTreeSet<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Unix milliseconds after which the entry is gone.
    expires_at: Option<i64>,
}

/// An in-memory store for tests and single-process deployments.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.lock().len())
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs follow the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`, to exercise caller deadlines.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|e| !is_expired(e, now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_string()));
        }
        Ok(())
    }

    /// Run `f` against the live (non-expired) entry map.
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> T) -> T {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !is_expired(e, now));
        f(&mut entries, now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key `{key}` holding the wrong kind of value"
    ))
}

fn zset_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> StoreResult<Option<&'a mut BTreeSet<(i64, String)>>> {
    match entries.get_mut(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::ZSet(set),
            ..
        }) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn remove_by_score(set: &mut BTreeSet<(i64, String)>, min: i64, max: i64) -> u64 {
    let before = set.len();
    set.retain(|(score, _)| *score < min || *score > max);
    (before - set.len()) as u64
}

/// Glob matching limited to `*` wildcards, which is all key sampling needs.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.enter().await?;
        self.with_entries(|entries, _| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.enter().await?;
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now.saturating_add(ttl_millis(ttl))),
                },
            );
            Ok(())
        })
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.enter().await?;
        self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now.saturating_add(ttl_millis(ttl))),
                },
            );
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.enter().await?;
        self.with_entries(|entries, _| Ok(entries.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.enter().await?;
        self.with_entries(|entries, _| Ok(entries.contains_key(key)))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| {
                        StoreError::Backend(format!("value at `{key}` is not an integer"))
                    })?;
                    let next = current.saturating_add(1);
                    *s = next.to_string();
                    Ok(next)
                }
                Value::ZSet(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.enter().await?;
        self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(ttl_millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.enter().await?;
        self.with_entries(|entries, now| {
            Ok(entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| Duration::from_millis((at - now).max(0) as u64)))
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::ZSet(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::ZSet(set) => {
                    set.retain(|(_, m)| m != member);
                    set.insert((score, member.to_string()));
                    Ok(())
                }
                Value::Str(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            Ok(zset_mut(entries, key)?.map_or(0, |set| set.len() as u64))
        })
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            Ok(zset_mut(entries, key)?
                .map(|set| {
                    set.iter()
                        .filter(|(score, _)| *score >= min && *score <= max)
                        .map(|(_, member)| member.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            let removed = zset_mut(entries, key)?.map_or(0, |set| remove_by_score(set, min, max));
            if matches!(entries.get(key), Some(Entry { value: Value::ZSet(set), .. }) if set.is_empty())
            {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.enter().await?;
        self.with_entries(|entries, _| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    async fn sliding_window(&self, request: &WindowRequest<'_>) -> StoreResult<WindowOutcome> {
        self.enter().await?;
        self.with_entries(|entries, now| {
            let cutoff = request.now_ms - request.window_ms;
            let (count, oldest) = match zset_mut(entries, request.key)? {
                Some(set) => {
                    remove_by_score(set, i64::MIN, cutoff);
                    (set.len() as u64, set.iter().next().map(|(score, _)| *score))
                }
                None => (0, None),
            };
            let reset_at_ms = oldest.unwrap_or(request.now_ms) + request.window_ms;

            if count < request.limit {
                let entry = entries
                    .entry(request.key.to_string())
                    .or_insert_with(|| Entry {
                        value: Value::ZSet(BTreeSet::new()),
                        expires_at: None,
                    });
                if let Value::ZSet(set) = &mut entry.value {
                    set.insert((request.now_ms, request.member.to_string()));
                }
                entry.expires_at = Some(now.saturating_add(request.window_ms.max(1)));

                Ok(WindowOutcome {
                    allowed: true,
                    remaining: request.limit - count - 1,
                    reset_at_ms,
                })
            } else {
                Ok(WindowOutcome {
                    allowed: false,
                    remaining: 0,
                    reset_at_ms,
                })
            }
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        replacement: Swap<'_>,
    ) -> StoreResult<bool> {
        self.enter().await?;
        self.with_entries(|entries, now| {
            let matches = matches!(
                entries.get(key),
                Some(Entry { value: Value::Str(current), .. }) if current == expected
            );
            if !matches {
                return Ok(false);
            }

            match replacement {
                Swap::Set { value, ttl } => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Str(value.to_string()),
                            expires_at: Some(now.saturating_add(ttl_millis(ttl))),
                        },
                    );
                }
                Swap::Delete => {
                    entries.remove(key);
                }
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_get_with_ttl() {
        let (store, clock) = store();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_keeps_expiry() {
        let (store, _clock) = store();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.ttl("n").await.unwrap(), None);

        store.expire("n", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert!(store.ttl("n").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ordered_set_operations() {
        let (store, _clock) = store();
        store.zadd("z", "a", 10).await.unwrap();
        store.zadd("z", "b", 20).await.unwrap();
        store.zadd("z", "c", 30).await.unwrap();
        store.zadd("z", "a", 25).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 3);
        assert_eq!(store.zrange_by_score("z", 0, 25).await.unwrap(), vec!["b", "a"]);
        assert_eq!(store.zrem_range_by_score("z", 0, 25).await.unwrap(), 2);
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let (store, _clock) = store();
        store.zadd("z", "a", 1).await.unwrap();
        assert!(store.get("z").await.is_err());
        assert!(store.incr("z").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_keys_glob() {
        let (store, _clock) = store();
        store.set("rate_limit:1.2.3.4", "x", Duration::from_secs(5)).await.unwrap();
        store.set("rate_limit:5.6.7.8", "x", Duration::from_secs(5)).await.unwrap();
        store.set("otp:code:a:b", "x", Duration::from_secs(5)).await.unwrap();

        let keys = store.scan_keys("rate_limit:*").await.unwrap();
        assert_eq!(keys, vec!["rate_limit:1.2.3.4", "rate_limit:5.6.7.8"]);
        assert!(glob_match("otp:*:a:*", "otp:code:a:b"));
        assert!(!glob_match("otp:*:z:*", "otp:code:a:b"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (store, _clock) = store();
        store.set("k", "one", Duration::from_secs(5)).await.unwrap();

        let swapped = store
            .compare_and_swap("k", "two", Swap::Delete)
            .await
            .unwrap();
        assert!(!swapped);

        let swapped = store
            .compare_and_swap(
                "k",
                "one",
                Swap::Set {
                    value: "two",
                    ttl: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();
        assert!(swapped);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));

        assert!(!store
            .compare_and_swap("missing", "one", Swap::Delete)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sliding_window_purges_and_counts() {
        let (store, _clock) = store();
        let mut request = WindowRequest {
            key: "w",
            limit: 2,
            window_ms: 1000,
            now_ms: 10_000,
            member: "m1",
        };

        let first = store.sliding_window(&request).await.unwrap();
        assert_eq!(first, WindowOutcome { allowed: true, remaining: 1, reset_at_ms: 11_000 });

        request.member = "m2";
        request.now_ms = 10_500;
        let second = store.sliding_window(&request).await.unwrap();
        assert_eq!(second, WindowOutcome { allowed: true, remaining: 0, reset_at_ms: 11_000 });

        request.member = "m3";
        request.now_ms = 10_900;
        let third = store.sliding_window(&request).await.unwrap();
        assert_eq!(third, WindowOutcome { allowed: false, remaining: 0, reset_at_ms: 11_000 });

        // m1 ages out at exactly now - window.
        request.now_ms = 11_000;
        let fourth = store.sliding_window(&request).await.unwrap();
        assert!(fourth.allowed);
        assert_eq!(fourth.reset_at_ms, 11_500);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let (store, _clock) = store();
        store.set_unavailable(true);
        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.kind(), "connection_refused");

        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn test_usable_outside_a_runtime() {
        let (store, _clock) = store();
        tokio_test::block_on(async {
            store.set("k", "v", Duration::from_secs(1)).await.unwrap();
            assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        });
    }

    #[tokio::test]
    async fn test_set_if_absent_claims_once() {
        let (store, clock) = store();
        assert!(store.set_if_absent("guard", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("guard", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("guard").await.unwrap().as_deref(), Some("a"));

        clock.advance(Duration::from_secs(1));
        assert!(store.set_if_absent("guard", "c", Duration::from_secs(1)).await.unwrap());
    }
}
