// cache.rs — keyed caches for compiled programs, kernels and plans.
//
// Three caches share one shape, `KeyedCache<K, V>`: a map from key to
// `Arc<V>` behind a single lock, with hit/miss counters. Creation runs
// under that lock, so two threads asking for the same key never build it
// twice. Statistics are read under the same lock and can only be stale,
// never torn.
//
//   ProgramCache  key = hash of the WGSL source text
//   KernelCache   key = (program id, entry point); evicted per program
//   PlanCache     key = JobShape (see transform.rs)
//
// The caches are device-agnostic: values are whatever the compile/create
// closure returns. gpu::session plugs in wgpu shader modules and compute
// pipelines; tests plug in plain strings.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Snapshot of a cache's size and lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache; 0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} hits, {} misses ({:.1}% hit rate)",
            self.entries,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Arc<V>>,
    hits: u64,
    misses: u64,
}

/// A lock-protected `K → Arc<V>` map with hit/miss accounting.
pub struct KeyedCache<K, V> {
    state: Mutex<CacheState<K, V>>,
}

impl<K: Eq + Hash + Clone, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> KeyedCache<K, V> {
    pub fn new() -> Self {
        KeyedCache {
            state: Mutex::new(CacheState { entries: HashMap::new(), hits: 0, misses: 0 }),
        }
    }

    /// Return the cached value for `key`, or build it with `create` and
    /// insert it. A failed build inserts nothing and still counts as a miss.
    pub fn get_or_try_insert<F>(&self, key: &K, create: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut state = self.state.lock();
        if let Some(v) = state.entries.get(key) {
            let v = Arc::clone(v);
            state.hits += 1;
            return Ok(v);
        }
        state.misses += 1;
        let v = Arc::new(create()?);
        state.entries.insert(key.clone(), Arc::clone(&v));
        Ok(v)
    }

    /// Lookup without touching the counters.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.state.lock().entries.remove(key)
    }

    /// Drop every entry for which `keep` returns false. Returns how many
    /// were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| keep(k));
        before - state.entries.len()
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats { entries: state.entries.len(), hits: state.hits, misses: state.misses }
    }
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// Identity of a compiled program: the hash of its source text.
pub type ProgramId = u64;

/// Hash `source` to its program id. Byte-identical sources share an id.
pub fn program_id(source: &str) -> ProgramId {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Compiled programs keyed by source hash.
pub struct ProgramCache<P> {
    inner: KeyedCache<ProgramId, P>,
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        ProgramCache { inner: KeyedCache::new() }
    }
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the program compiled from `source`, compiling it on first
    /// use. `compile` receives the program id and the source.
    pub fn get_or_compile<F>(&self, source: &str, compile: F) -> Result<(ProgramId, Arc<P>)>
    where
        F: FnOnce(ProgramId, &str) -> Result<P>,
    {
        let id = program_id(source);
        let program = self.inner.get_or_try_insert(&id, || {
            log::debug!("compiling program {id:016x} ({} bytes of source)", source.len());
            compile(id, source)
        })?;
        Ok((id, program))
    }

    pub fn get(&self, id: ProgramId) -> Option<Arc<P>> {
        self.inner.peek(&id)
    }

    /// Evict one program. Kernels built from it live in a separate
    /// [`KernelCache`] and must be cleared there.
    pub fn remove(&self, id: ProgramId) -> Option<Arc<P>> {
        self.inner.remove(&id)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Kernels keyed by (program id, entry point name).
pub struct KernelCache<K> {
    inner: KeyedCache<(ProgramId, String), K>,
}

impl<K> Default for KernelCache<K> {
    fn default() -> Self {
        KernelCache { inner: KeyedCache::new() }
    }
}

impl<K> KernelCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached kernel for `(program, name)`, created with `create` on a miss.
    pub fn get_or_create<F>(&self, program: ProgramId, name: &str, create: F) -> Result<Arc<K>>
    where
        F: FnOnce() -> Result<K>,
    {
        self.inner.get_or_try_insert(&(program, name.to_string()), || {
            log::debug!("creating kernel `{name}` for program {program:016x}");
            create()
        })
    }

    pub fn contains(&self, program: ProgramId, name: &str) -> bool {
        self.inner.contains(&(program, name.to_string()))
    }

    /// Drop every kernel built from `program`. Other programs' kernels are
    /// untouched. Returns the number dropped.
    pub fn clear_for_program(&self, program: ProgramId) -> usize {
        let dropped = self.inner.retain(|(p, _)| *p != program);
        log::debug!("cleared {dropped} kernel(s) for program {program:016x}");
        dropped
    }

    /// Drop everything; kernels are recreated lazily on the next lookup.
    pub fn clear_all(&self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
