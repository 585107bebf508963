//! Per-thread shared instance data.
//!
//! Conditions, considerations and property functions keep no state across
//! calls, so their blocks are pooled per calling thread instead of per running
//! instance. The pool for a thread is created the first time that thread
//! drives the definition and cached for the definition's lifetime.

use crate::handle::SharedIndex;
use crate::value::{StructType, StructValue};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug)]
pub struct SharedInstancePool {
    values: Vec<Option<StructValue>>,
}

impl SharedInstancePool {
    pub fn new(types: &[Arc<StructType>]) -> Self {
        SharedInstancePool {
            values: types.iter().map(|ty| Some(StructValue::new(ty))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: SharedIndex) -> Option<&StructValue> {
        self.values.get(index.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: SharedIndex) -> Option<&mut StructValue> {
        self.values.get_mut(index.index()).and_then(Option::as_mut)
    }

    pub fn take(&mut self, index: SharedIndex) -> Option<StructValue> {
        self.values.get_mut(index.index()).and_then(Option::take)
    }

    pub fn restore(&mut self, index: SharedIndex, value: StructValue) {
        if let Some(slot) = self.values.get_mut(index.index()) {
            *slot = Some(value);
        }
    }
}

/// Registry of one pool per calling thread.
///
/// Lookup takes the read lock; only the first call from a new thread takes
/// the write lock. This is the only lock touched while ticking.
#[derive(Debug)]
pub struct SharedInstanceCache {
    types: Vec<Arc<StructType>>,
    pools: RwLock<Vec<(ThreadId, Arc<Mutex<SharedInstancePool>>)>>,
}

impl SharedInstanceCache {
    pub fn new(types: Vec<Arc<StructType>>) -> Self {
        SharedInstanceCache {
            types,
            pools: RwLock::new(Vec::new()),
        }
    }

    pub fn types(&self) -> &[Arc<StructType>] {
        &self.types
    }

    /// Pool of the calling thread, created on first use.
    pub fn for_current_thread(&self) -> Arc<Mutex<SharedInstancePool>> {
        let id = thread::current().id();
        if let Some(pool) = Self::find(&self.pools.read(), id) {
            return pool;
        }
        let mut pools = self.pools.write();
        if let Some(pool) = Self::find(&pools, id) {
            return pool;
        }
        tracing::trace!(thread = ?id, slots = self.types.len(), "creating shared instance pool");
        let pool = Arc::new(Mutex::new(SharedInstancePool::new(&self.types)));
        pools.push((id, pool.clone()));
        pool
    }

    pub fn thread_count(&self) -> usize {
        self.pools.read().len()
    }

    fn find(
        pools: &[(ThreadId, Arc<Mutex<SharedInstancePool>>)],
        id: ThreadId,
    ) -> Option<Arc<Mutex<SharedInstancePool>>> {
        pools
            .iter()
            .find(|(thread, _)| *thread == id)
            .map(|(_, pool)| pool.clone())
    }
}
