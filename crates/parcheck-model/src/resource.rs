//! Reference-counted handle allocator for objects shared across branches.
//!
//! Process snapshots and message buffers are owned by many simultaneously
//! live branches; copy-on-write branching only bumps their reference count.
//! Dropping the last reference parks the object in a pending-cleanup pool
//! instead of freeing inline, because the underlying free operation (a
//! controller round-trip for snapshots) is too expensive to issue per
//! decrement. A hash-keyed cache revives parked objects when a later branch
//! converges on the same content.

use crate::hash::ContentHash;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Opaque handle to a managed resource. Handles are worker-local and never
/// cross the wire; peers re-attach by content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Placeholder for a handle that has not been attached yet (a
    /// deserialized reference before revival).
    pub const DETACHED: ResourceId = ResourceId(u64::MAX);

    #[inline]
    pub fn is_detached(self) -> bool {
        self == Self::DETACHED
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_detached() {
            write!(f, "ResourceId(detached)")
        } else {
            write!(f, "ResourceId({})", self.0)
        }
    }
}

struct Entry<T> {
    value: T,
    hash: ContentHash,
    refs: usize,
}

/// Generic reference-counted resource manager. Knows nothing about
/// message-passing semantics; one instance per resource kind per worker.
pub struct ResourceManager<T> {
    entries: HashMap<ResourceId, Entry<T>, RandomState>,
    by_hash: HashMap<ContentHash, ResourceId, RandomState>,
    pending: Vec<ResourceId>,
    next: u64,
}

impl<T> ResourceManager<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::default(),
            by_hash: HashMap::default(),
            pending: Vec::new(),
            next: 0,
        }
    }

    /// Allocate a handle for `value` with reference count 1. If an object
    /// with the same content hash is already managed, the existing handle is
    /// revived instead and `value` is returned to the caller for disposal.
    pub fn alloc(&mut self, hash: ContentHash, value: T) -> (ResourceId, Option<T>) {
        if let Some(&id) = self.by_hash.get(&hash) {
            self.inc_ref(id);
            return (id, Some(value));
        }
        let id = ResourceId(self.next);
        self.next += 1;
        self.entries.insert(
            id,
            Entry {
                value,
                hash,
                refs: 1,
            },
        );
        self.by_hash.insert(hash, id);
        trace!(id = id.0, %hash, "resource allocated");
        (id, None)
    }

    /// Revive an object by content hash, bumping its reference count.
    /// Returns `None` if the hash is not materialized on this worker.
    pub fn revive(&mut self, hash: ContentHash) -> Option<ResourceId> {
        let id = *self.by_hash.get(&hash)?;
        self.inc_ref(id);
        Some(id)
    }

    /// Non-bumping lookup by content hash.
    pub fn lookup(&self, hash: ContentHash) -> Option<ResourceId> {
        self.by_hash.get(&hash).copied()
    }

    pub fn inc_ref(&mut self, id: ResourceId) {
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("inc_ref on unknown {:?}", id));
        entry.refs += 1;
    }

    /// Decrement the reference count. Reaching zero parks the object in the
    /// pending-cleanup pool; it stays revivable until `drain_pending` runs.
    pub fn dec_ref(&mut self, id: ResourceId) {
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("dec_ref on unknown {:?}", id));
        assert!(entry.refs > 0, "dec_ref below zero for {:?}", id);
        entry.refs -= 1;
        if entry.refs == 0 {
            self.pending.push(id);
        }
    }

    pub fn get(&self, id: ResourceId) -> &T {
        &self
            .entries
            .get(&id)
            .unwrap_or_else(|| panic!("get on unknown {:?}", id))
            .value
    }

    pub fn hash_of(&self, id: ResourceId) -> ContentHash {
        self.entries
            .get(&id)
            .unwrap_or_else(|| panic!("hash_of on unknown {:?}", id))
            .hash
    }

    pub fn ref_count(&self, id: ResourceId) -> usize {
        self.entries.get(&id).map(|e| e.refs).unwrap_or(0)
    }

    /// Number of managed objects, parked ones included.
    pub fn resource_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of objects with a non-zero reference count.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.refs > 0).count()
    }

    /// Free every parked object whose count is still zero, invoking `free`
    /// for each (snapshots need a controller `FREE` round-trip). Batched and
    /// driven by the owning worker between branches.
    pub fn drain_pending<F: FnMut(ContentHash, T)>(&mut self, mut free: F) {
        let pending = std::mem::take(&mut self.pending);
        for id in pending {
            // A revival may have brought the count back up since parking.
            let still_dead = self.entries.get(&id).map(|e| e.refs == 0).unwrap_or(false);
            if !still_dead {
                continue;
            }
            let entry = self.entries.remove(&id).unwrap();
            self.by_hash.remove(&entry.hash);
            trace!(id = id.0, hash = %entry.hash, "resource freed");
            free(entry.hash, entry.value);
        }
        self.assert_consistent();
    }

    /// The cache and the entry table must describe the same object set.
    pub fn assert_consistent(&self) {
        debug_assert_eq!(self.by_hash.len(), self.entries.len());
        for (&hash, &id) in &self.by_hash {
            debug_assert_eq!(self.entries.get(&id).map(|e| e.hash), Some(hash));
        }
    }
}

impl<T> Default for ResourceManager<T> {
    fn default() -> Self {
        Self::new()
    }
}
