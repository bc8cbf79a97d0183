//! Queue storage backends

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Result of appending to a bounded list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// List length after eviction
    pub len: usize,
    /// Oldest entries dropped to stay within the bound
    pub evicted: usize,
}

/// List and hash primitives the durable queue is built on. Each call must
/// be atomic with respect to concurrent callers on the same key.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append `entries` to the tail and trim the head down to `max_len`
    async fn push(&self, key: &str, entries: Vec<Vec<u8>>, max_len: usize) -> Result<PushOutcome>;

    /// Remove and return up to `count` entries from the head
    async fn pop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>>;

    async fn len(&self, key: &str) -> Result<usize>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Replace hash fields and reset the key's expiry
    async fn set_hash(&self, key: &str, fields: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()>;

    /// All fields of a live hash; empty when missing or expired
    async fn get_hash(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, (HashMap<String, Vec<u8>>, Instant)>,
}

/// In-process backend for tests and dry runs. Contents do not survive a
/// restart.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, key: &str, entries: Vec<Vec<u8>>, max_len: usize) -> Result<PushOutcome> {
        let mut state = self.state.lock().await;
        let list = state.lists.entry(key.to_string()).or_default();
        list.extend(entries);

        let evicted = list.len().saturating_sub(max_len);
        list.drain(..evicted);

        Ok(PushOutcome {
            len: list.len(),
            evicted,
        })
    }

    async fn pop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let n = count.min(list.len());
        Ok(list.drain(..n).collect())
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lists.remove(key);
        state.hashes.remove(key);
        Ok(())
    }

    async fn set_hash(&self, key: &str, fields: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let entry = state
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| (HashMap::new(), now));
        if entry.1 <= now {
            entry.0.clear();
        }
        entry.0.extend(fields);
        entry.1 = now + ttl;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(match state.hashes.get(key) {
            Some((fields, expires)) if *expires > Instant::now() => fields.clone(),
            _ => HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(range: std::ops::RangeInclusive<u8>) -> Vec<Vec<u8>> {
        range.map(|b| vec![b]).collect()
    }

    #[tokio::test]
    async fn test_push_trims_head() {
        let backend = MemoryBackend::new();
        let outcome = backend.push("k", entries(1..=3), 5).await.unwrap();
        assert_eq!(outcome, PushOutcome { len: 3, evicted: 0 });

        let outcome = backend.push("k", entries(4..=7), 5).await.unwrap();
        assert_eq!(outcome, PushOutcome { len: 5, evicted: 2 });
        assert_eq!(backend.pop("k", 1).await.unwrap(), vec![vec![3]]);
    }

    #[tokio::test]
    async fn test_pop_missing_key() {
        let backend = MemoryBackend::new();
        assert!(backend.pop("missing", 10).await.unwrap().is_empty());
        assert_eq!(backend.len("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set_hash("h", vec![("data".to_string(), b"x".to_vec())], Duration::ZERO)
            .await
            .unwrap();
        assert!(backend.get_hash("h").await.unwrap().is_empty());

        backend
            .set_hash("h", vec![("data".to_string(), b"y".to_vec())], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get_hash("h").await.unwrap()["data"], b"y".to_vec());
    }
}
