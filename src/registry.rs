// registry.rs — opt-in named buffer reuse.
//
// The registry maps a string key to a weakly held buffer. It never keeps a
// buffer alive by itself: once every `Arc` handed out is dropped, the entry
// is dead, `get` returns `None`, and the next `cleanup_expired` pass prunes
// it. Pruning is explicit so that lookups stay O(1); long-running loops
// should call `cleanup_expired` every so often, not on every access.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;

/// String-keyed weak references to shared buffers.
pub struct BufferRegistry<B> {
    entries: Mutex<HashMap<String, Weak<B>>>,
}

impl<B> Default for BufferRegistry<B> {
    fn default() -> Self {
        BufferRegistry { entries: Mutex::new(HashMap::new()) }
    }
}

impl<B> BufferRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `buffer` under `key`, replacing any previous entry.
    pub fn register(&self, key: impl Into<String>, buffer: &Arc<B>) {
        self.entries.lock().insert(key.into(), Arc::downgrade(buffer));
    }

    /// The buffer under `key` if something still holds it.
    pub fn get(&self, key: &str) -> Option<Arc<B>> {
        self.entries.lock().get(key).and_then(Weak::upgrade)
    }

    /// The live buffer under `key`, or a new one from `create`.
    ///
    /// Check and insert happen under one lock, so concurrent callers with
    /// the same key end up sharing a single allocation.
    pub fn get_or_create<F>(&self, key: &str, create: F) -> Result<Arc<B>>
    where
        F: FnOnce() -> Result<B>,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let buffer = Arc::new(create()?);
        entries.insert(key.to_string(), Arc::downgrade(&buffer));
        log::trace!("registry: created `{key}`");
        Ok(buffer)
    }

    /// Remove the entry under `key`; the buffer itself is unaffected.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Prune entries whose buffers have been dropped. Returns the number
    /// pruned.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        let pruned = before - entries.len();
        if pruned > 0 {
            log::debug!("registry: pruned {pruned} expired buffer(s)");
        }
        pruned
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of entries whose buffers are still alive.
    pub fn live_keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
