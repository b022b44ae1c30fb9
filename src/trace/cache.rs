//! Memoization of abstract evaluation and graph transformations.
//!
//! Tables are keyed by value equality of their inputs and guarded by mutexes,
//! so a [`Registry`](crate::trace::Registry) shared across threads can serve
//! concurrent lookups. Locks are never held while a transformation runs, which
//! keeps recursive transformations (splitting a call body while splitting the
//! caller) free of deadlocks. Each table is bounded by
//! [`Config::cache_capacity`](crate::Config::cache_capacity) and evicts its
//! least recently used entry when full.

use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::trace::effects::Effects;
use crate::trace::partial_eval::{SavePolicy, StagedSplit};
use crate::trace::{AbstractValue, Graph, Params, Primitive};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

type AbstractEvalKey = (Primitive, Vec<AbstractValue>, Params);
type AbstractEvalResult = (Vec<AbstractValue>, Effects);

/// Inputs of a graph split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SplitKey {
    pub(crate) graph: Graph,
    pub(crate) in_unknowns: Vec<bool>,
    pub(crate) in_inst: Vec<bool>,
    pub(crate) ensure_out_unknowns: Vec<bool>,
    pub(crate) ensure_out_inst: Vec<bool>,
    pub(crate) policy: SavePolicy,
}

/// Inputs of a DCE pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DceKey {
    pub(crate) graph: Graph,
    pub(crate) used_outputs: Vec<bool>,
    pub(crate) instantiate: Vec<bool>,
}

/// Hit and miss counts of a [`TransformCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a table.
    pub hits: usize,
    /// Lookups that had to compute.
    pub misses: usize,
}

struct Table<K, V> {
    entries: HashMap<K, (V, u64)>,
    clock: u64,
}

/// A bounded table that evicts its least recently used entry when full.
struct Memo<K, V> {
    name: &'static str,
    capacity: usize,
    table: Mutex<Table<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Memo<K, V> {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self { name, capacity, table: Mutex::new(Table { entries: HashMap::new(), clock: 0 }) }
    }

    fn lock(&self) -> MutexGuard<'_, Table<K, V>> {
        // Entries are inserted whole, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut table = self.lock();
        table.clock += 1;
        let now = table.clock;
        table.entries.get_mut(key).map(|(value, used)| {
            *used = now;
            value.clone()
        })
    }

    fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut table = self.lock();
        table.clock += 1;
        let now = table.clock;
        if table.entries.len() >= self.capacity && !table.entries.contains_key(&key) {
            let oldest = table.entries.iter().min_by_key(|(_, (_, used))| *used).map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                table.entries.remove(&oldest);
                log::trace!("{} cache full, evicted an entry", self.name);
            }
        }
        table.entries.insert(key, (value, now));
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn clear(&self) {
        let mut table = self.lock();
        table.entries.clear();
        table.clock = 0;
    }
}

/// Memo tables owned by a registry.
pub struct TransformCache {
    abstract_eval: Memo<AbstractEvalKey, AbstractEvalResult>,
    splits: Memo<SplitKey, StagedSplit>,
    dce: Memo<DceKey, (Graph, Vec<bool>)>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl TransformCache {
    /// Empty cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Empty cache holding at most `capacity` entries per table.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            abstract_eval: Memo::new("abstract_eval", capacity),
            splits: Memo::new("partial_eval", capacity),
            dce: Memo::new("dce", capacity),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn record<K: Eq + Hash + Clone, V: Clone>(&self, memo: &Memo<K, V>, key: &K) -> Option<V> {
        let found = memo.get(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("{} cache hit", memo.name);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub(crate) fn lookup_abstract_eval(
        &self,
        prim: &Primitive,
        avals: &[AbstractValue],
        params: &Params,
    ) -> Option<AbstractEvalResult> {
        let key = (prim.clone(), avals.to_vec(), params.clone());
        self.record(&self.abstract_eval, &key)
    }

    pub(crate) fn insert_abstract_eval(
        &self,
        prim: &Primitive,
        avals: &[AbstractValue],
        params: &Params,
        result: AbstractEvalResult,
    ) {
        self.abstract_eval.insert((prim.clone(), avals.to_vec(), params.clone()), result);
    }

    pub(crate) fn lookup_split(&self, key: &SplitKey) -> Option<StagedSplit> {
        let found = self.record(&self.splits, key);
        if found.is_some() {
            log::debug!("reusing split of `{}`", key.graph.name);
        }
        found
    }

    pub(crate) fn insert_split(&self, key: SplitKey, split: StagedSplit) {
        self.splits.insert(key, split);
    }

    pub(crate) fn lookup_dce(&self, key: &DceKey) -> Option<(Graph, Vec<bool>)> {
        let found = self.record(&self.dce, key);
        if found.is_some() {
            log::debug!("reusing DCE of `{}`", key.graph.name);
        }
        found
    }

    pub(crate) fn insert_dce(&self, key: DceKey, result: (Graph, Vec<bool>)) {
        self.dce.insert(key, result);
    }

    /// Hit and miss counts since creation or the last [`clear`](Self::clear).
    pub fn stats(&self) -> CacheStats {
        CacheStats { hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed) }
    }

    /// Number of memoized entries across all tables.
    pub fn len(&self) -> usize {
        self.abstract_eval.len() + self.splits.len() + self.dce.len()
    }

    /// Returns true if nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.abstract_eval.clear();
        self.splits.clear();
        self.dce.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for TransformCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransformCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCache").field("entries", &self.len()).field("stats", &self.stats()).finish()
    }
}
