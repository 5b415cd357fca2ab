//! Bounded, recency-ordered admission and eviction over image names.
//!
//! A thin wrapper around an LRU map that dispatches side effects through
//! [`RecencyHooks`] installed at construction: `on_admit` when a new name
//! enters the index, `on_evict` when an insert pushes the least-recent
//! name out. Hooks run synchronously from the touching call, so no further
//! mutation happens until a hook returns.
//!
//! `touch_silent` suppresses only the admit hook — an insert that
//! overflows capacity still evicts, which is what trims the store when
//! `--max-count` shrinks between runs.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use tracing::info;

use crate::error::{CacheError, Result};

/// Payload tracked per image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub image_name: String,
    pub image_id: String,
}

/// Side effects invoked by the index on admission and eviction.
///
/// Implementations must not fail: outcomes are logged by the hook itself
/// and never abort the caller.
#[async_trait]
pub trait RecencyHooks: Send + Sync {
    async fn on_admit(&self, image_name: &str, image_id: &str);
    async fn on_evict(&self, image_name: &str, image_id: &str);
}

/// LRU-ordered set of cached image names with a fixed capacity.
pub struct RecencyIndex {
    entries: LruCache<String, CacheItem>,
    hooks: Box<dyn RecencyHooks>,
}

impl std::fmt::Debug for RecencyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecencyIndex")
            .field("entries", &self.entries)
            .field("hooks", &"<dyn RecencyHooks>")
            .finish()
    }
}

impl RecencyIndex {
    /// Create an index bounded to `max_count` images.
    ///
    /// Fails with [`CacheError::InvalidCapacity`] for zero — a fatal
    /// misconfiguration at startup.
    pub fn new(max_count: usize, hooks: Box<dyn RecencyHooks>) -> Result<Self> {
        let capacity =
            NonZeroUsize::new(max_count).ok_or(CacheError::InvalidCapacity(max_count))?;
        info!("LRU eviction, max-count: {max_count}");
        Ok(Self {
            entries: LruCache::new(capacity),
            hooks,
        })
    }

    /// Move the name to the front, firing `on_admit` when it is new to the
    /// index (after any eviction the insert caused).
    pub async fn touch(&mut self, image_name: &str, image_id: &str) {
        let is_new = !self.entries.contains(image_name);
        self.insert(image_name, image_id).await;
        if is_new {
            self.hooks.on_admit(image_name, image_id).await;
        }
    }

    /// Move the name to the front without firing `on_admit`. An insert
    /// that overflows capacity still fires `on_evict`.
    pub async fn touch_silent(&mut self, image_name: &str, image_id: &str) {
        self.insert(image_name, image_id).await;
    }

    async fn insert(&mut self, image_name: &str, image_id: &str) {
        let item = CacheItem {
            image_name: image_name.to_string(),
            image_id: image_id.to_string(),
        };
        if let Some((evicted_name, evicted)) = self.entries.push(image_name.to_string(), item) {
            // A returned pair with the same key is a value replacement,
            // not an eviction.
            if evicted_name != image_name {
                self.hooks
                    .on_evict(&evicted.image_name, &evicted.image_id)
                    .await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, image_name: &str) -> bool {
        self.entries.contains(image_name)
    }

    /// The most recently touched item, if any.
    pub fn most_recent(&self) -> Option<&CacheItem> {
        self.entries.iter().next().map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RecencyHooks for Recorder {
        async fn on_admit(&self, image_name: &str, _image_id: &str) {
            self.calls.lock().unwrap().push(format!("admit {image_name}"));
        }

        async fn on_evict(&self, image_name: &str, _image_id: &str) {
            self.calls.lock().unwrap().push(format!("evict {image_name}"));
        }
    }

    fn index(max_count: usize) -> (RecencyIndex, Arc<Mutex<Vec<String>>>) {
        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        (RecencyIndex::new(max_count, Box::new(recorder)).unwrap(), calls)
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let recorder = Recorder::default();
        let err = RecencyIndex::new(0, Box::new(recorder)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCapacity(0)));
    }

    #[tokio::test]
    async fn test_admit_fires_for_new_keys_only() {
        let (mut index, calls) = index(3);

        index.touch("a", "a1").await;
        index.touch("a", "a2").await;

        assert_eq!(*calls.lock().unwrap(), vec!["admit a"]);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_capacity() {
        let (mut index, _calls) = index(2);

        for name in ["a", "b", "c", "d"] {
            index.touch(name, "id").await;
            assert!(index.len() <= 2);
        }
    }

    #[tokio::test]
    async fn test_least_recent_key_is_evicted() {
        let (mut index, calls) = index(2);

        index.touch("a", "a1").await;
        index.touch("b", "b1").await;
        // Refresh "a" so "b" becomes least recent.
        index.touch("a", "a1").await;
        index.touch("c", "c1").await;

        assert!(index.contains("a"));
        assert!(!index.contains("b"));
        assert!(index.contains("c"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["admit a", "admit b", "evict b", "admit c"]
        );
    }

    #[tokio::test]
    async fn test_evict_fires_before_admit_on_overflow() {
        let (mut index, calls) = index(1);

        index.touch("x", "x1").await;
        index.touch("y", "y1").await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["admit x", "evict x", "admit y"]
        );
        assert_eq!(index.most_recent().unwrap().image_name, "y");
    }

    #[tokio::test]
    async fn test_touch_silent_suppresses_admit_but_not_evict() {
        let (mut index, calls) = index(1);

        index.touch_silent("a", "a1").await;
        index.touch_silent("b", "b1").await;

        assert_eq!(*calls.lock().unwrap(), vec!["evict a"]);
        assert_eq!(index.most_recent().unwrap().image_name, "b");
    }
}
