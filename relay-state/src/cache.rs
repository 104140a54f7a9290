//! The durable cache seam (§6's persistent cache keys).
//!
//! `Cache` is deliberately narrow: every operation the state service needs is a single-key
//! read, write, or atomic script invocation, so cross-key consistency is never required
//! (§5). [`RedisCache`] is the production implementation; [`InMemoryCache`] backs tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use redis::Commands;

use crate::error::StateError;

/// `KEYS[1]` is the counter key; `ARGV[1]` is the caller's expected previous value, `ARGV[2]`
/// the TTL in seconds. A missing key reads as `0` (no client-id has been accepted yet). Stores
/// `ARGV[1] + 1` and returns `1` iff the stored value equals `ARGV[1]`; otherwise leaves the
/// key untouched and returns `0`. This script's atomicity is the dedup invariant from §4.6:
/// the caller passes `client_id - 1` as the expected previous value, so a duplicate or
/// out-of-order client-id simply fails to match and is dropped.
const COMPARE_AND_INCREMENT_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false then
    cur = 0
else
    cur = tonumber(cur)
end
local expected = tonumber(ARGV[1])
if cur == expected then
    redis.call('SET', KEYS[1], expected + 1, 'EX', ARGV[2])
    return 1
else
    return 0
end
"#;

/// The single-key cache operations the state service needs (§6).
pub trait Cache: Send + Sync {
    /// Adds `member` to the set at `key` (`login_slot:<slot>`, no TTL).
    fn sadd(&self, key: &str, member: &str) -> Result<(), StateError>;

    /// Lists every member of the set at `key`.
    fn smembers(&self, key: &str) -> Result<Vec<String>, StateError>;

    /// Removes `member` from the set at `key`; a no-op if absent.
    fn srem(&self, key: &str, member: &str) -> Result<(), StateError>;

    /// Reads the raw bytes at `key`, or `None` if absent.
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// Writes `value` at `key`, with an optional TTL.
    fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StateError>;

    /// Deletes `key`; a no-op if it does not exist.
    fn del(&self, key: &str) -> Result<(), StateError>;

    /// Atomically compares `expected_prev` against the counter stored at `key` (absent reads
    /// as `0`) and, if equal, stores `expected_prev + 1` with `ttl` and returns `true`;
    /// otherwise leaves the stored value untouched and returns `false` (§4.6's
    /// compare-and-increment). Callers pass `client_id - 1` as `expected_prev` so that only
    /// the next client-id in sequence succeeds.
    fn compare_and_increment(&self, key: &str, expected_prev: u64, ttl: Duration) -> Result<bool, StateError>;
}

/// A `redis`-backed [`Cache`], the production implementation.
pub struct RedisCache {
    client: redis::Client,
    compare_and_increment: redis::Script,
}

impl RedisCache {
    /// Connects to `redis_url` (e.g. `redis://127.0.0.1/`). Connection is lazy — the first
    /// real I/O happens on the first call.
    pub fn connect(redis_url: &str) -> Result<Self, StateError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            compare_and_increment: redis::Script::new(COMPARE_AND_INCREMENT_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl Cache for RedisCache {
    fn sadd(&self, key: &str, member: &str) -> Result<(), StateError> {
        let mut conn = self.client.get_connection()?;
        let _: () = conn.sadd(key, member)?;
        Ok(())
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, StateError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.smembers(key)?)
    }

    fn srem(&self, key: &str, member: &str) -> Result<(), StateError> {
        let mut conn = self.client.get_connection()?;
        let _: () = conn.srem(key, member)?;
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.get(key)?)
    }

    fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StateError> {
        let mut conn = self.client.get_connection()?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs())?;
            }
            None => {
                let _: () = conn.set(key, value)?;
            }
        }
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StateError> {
        let mut conn = self.client.get_connection()?;
        let _: () = conn.del(key)?;
        Ok(())
    }

    fn compare_and_increment(&self, key: &str, expected_prev: u64, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.client.get_connection()?;
        let result: i64 = self
            .compare_and_increment
            .key(key)
            .arg(expected_prev)
            .arg(ttl.as_secs())
            .invoke(&mut conn)?;
        Ok(result > 0)
    }
}

/// An in-process [`Cache`] with no external dependency and no TTL enforcement — values simply
/// never expire. Used by tests and by the standalone examples.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    sets: Mutex<HashMap<String, HashSet<String>>>,
    values: Mutex<HashMap<String, Vec<u8>>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for InMemoryCache {
    fn sadd(&self, key: &str, member: &str) -> Result<(), StateError> {
        self.sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, StateError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn srem(&self, key: &str, member: &str) -> Result<(), StateError> {
        if let Some(members) = self.sets.lock().unwrap().get_mut(key) {
            members.remove(member);
        }
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set_bytes(&self, key: &str, value: &[u8], _ttl: Option<Duration>) -> Result<(), StateError> {
        self.values.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StateError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    fn compare_and_increment(&self, key: &str, expected_prev: u64, _ttl: Duration) -> Result<bool, StateError> {
        let mut counters = self.counters.lock().unwrap();
        let current = counters.entry(key.to_string()).or_insert(0);
        if *current == expected_prev {
            *current = expected_prev + 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sadd_and_smembers_round_trip() {
        let cache = InMemoryCache::new();
        cache.sadd("login_slot:3", "1001|42").unwrap();
        cache.sadd("login_slot:3", "1002|43").unwrap();
        let mut members = cache.smembers("login_slot:3").unwrap();
        members.sort();
        assert_eq!(members, vec!["1001|42".to_string(), "1002|43".to_string()]);
    }

    #[test]
    fn srem_removes_only_the_named_member() {
        let cache = InMemoryCache::new();
        cache.sadd("login_slot:3", "1001|42").unwrap();
        cache.sadd("login_slot:3", "1002|43").unwrap();
        cache.srem("login_slot:3", "1001|42").unwrap();
        assert_eq!(cache.smembers("login_slot:3").unwrap(), vec!["1002|43".to_string()]);
    }

    #[test]
    fn compare_and_increment_accepts_only_the_next_expected_value() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60 * 60 * 24 * 7);
        // client-id 1: expected_prev 0, matches the implicit starting value.
        assert!(cache.compare_and_increment("max_client_id:0:1:1", 0, ttl).unwrap());
        // a duplicate resend of client-id 1 presents the same expected_prev again and fails.
        assert!(!cache.compare_and_increment("max_client_id:0:1:1", 0, ttl).unwrap());
        // client-id 2: expected_prev 1, matches what client-id 1 just stored.
        assert!(cache.compare_and_increment("max_client_id:0:1:1", 1, ttl).unwrap());
        // a skip-ahead to client-id 4 (expected_prev 3) does not match the stored 2.
        assert!(!cache.compare_and_increment("max_client_id:0:1:1", 3, ttl).unwrap());
    }

    #[test]
    fn get_set_del_bytes_round_trip() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get_bytes("last_msg:0:42").unwrap(), None);
        cache.set_bytes("last_msg:0:42", b"payload", None).unwrap();
        assert_eq!(cache.get_bytes("last_msg:0:42").unwrap(), Some(b"payload".to_vec()));
        cache.del("last_msg:0:42").unwrap();
        assert_eq!(cache.get_bytes("last_msg:0:42").unwrap(), None);
    }
}
