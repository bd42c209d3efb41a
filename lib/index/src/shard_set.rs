use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roaring::RoaringTreemap;

use crate::error::IndexResult;
use crate::types::ShardId;

/// Set of shards known to contain data for one view.
///
/// Reads escape the current set object to the caller; the shared-out flag
/// makes the next mutation clone instead of touching an object a reader may
/// still be holding. Consecutive mutations with no intervening read reuse
/// one allocation.
///
/// The enclosing view's lock provides exclusion: `available` is called under
/// the read lock, `add`/`remove` under the write lock. The flag itself is
/// atomic so the read path never upgrades.
pub struct ShardSet {
    shards: Arc<RoaringTreemap>,
    shared_out: AtomicBool,
}

impl Default for ShardSet {
    fn default() -> Self {
        ShardSet::from_bitmap(RoaringTreemap::new())
    }
}

impl ShardSet {
    pub fn new() -> ShardSet {
        ShardSet::default()
    }

    pub fn from_bitmap(shards: RoaringTreemap) -> ShardSet {
        ShardSet {
            shards: Arc::new(shards),
            shared_out: AtomicBool::new(false),
        }
    }

    /// Current set object. Marks the object shared-out; the caller must
    /// treat it as immutable.
    pub fn available(&self) -> Arc<RoaringTreemap> {
        self.shared_out.store(true, Ordering::Release);
        Arc::clone(&self.shards)
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.shards.contains(shard)
    }

    pub fn cardinality(&self) -> u64 {
        self.shards.len()
    }

    /// Returns true if the shard was not yet present.
    pub fn add(&mut self, shard: ShardId) -> bool {
        self.detach();
        Arc::make_mut(&mut self.shards).insert(shard)
    }

    /// Returns true if the shard was present.
    pub fn remove(&mut self, shard: ShardId) -> bool {
        self.detach();
        Arc::make_mut(&mut self.shards).remove(shard)
    }

    // Replace a shared-out set with a private clone before mutating it.
    fn detach(&mut self) {
        if self.shared_out.swap(false, Ordering::AcqRel) {
            self.shards = Arc::new((*self.shards).clone());
        }
    }
}

/// Source of the initial shard set of a view, queried on open. The cluster
/// node backs this with its remote-availability state; tests use the
/// in-memory variant.
pub trait ShardSnapshotSource: Send + Sync {
    fn available_shards(&self, index: &str, field: &str, view: &str)
        -> IndexResult<RoaringTreemap>;
}

/// Fixed snapshot source, for single-node starts and tests.
#[derive(Default)]
pub struct StaticShardSource {
    shards: RoaringTreemap,
}

impl StaticShardSource {
    pub fn new(shards: impl IntoIterator<Item = ShardId>) -> StaticShardSource {
        StaticShardSource {
            shards: shards.into_iter().collect(),
        }
    }
}

impl ShardSnapshotSource for StaticShardSource {
    fn available_shards(
        &self,
        _index: &str,
        _field: &str,
        _view: &str,
    ) -> IndexResult<RoaringTreemap> {
        Ok(self.shards.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_on_escaped_read() {
        let mut set = ShardSet::new();
        set.add(1);
        set.add(2);

        let escaped = set.available();
        assert!(escaped.contains(1) && escaped.contains(2));

        // The escaped object must not see the mutation.
        set.add(3);
        assert!(!escaped.contains(3));
        assert!(set.contains(3));

        // A fresh read sees the latest committed state.
        let current = set.available();
        assert!(!Arc::ptr_eq(&escaped, &current));
        assert_eq!(current.len(), 3);
    }

    #[test]
    fn test_consecutive_mutations_reuse_allocation() {
        let mut set = ShardSet::new();
        set.add(7);
        let before = set.available();

        set.add(8);
        let after_first = Arc::as_ptr(&set.shards);
        set.add(9);
        set.remove(7);
        let after_last = Arc::as_ptr(&set.shards);

        // One clone for the escaped read, then in-place mutation.
        assert!(!std::ptr::eq(Arc::as_ptr(&before), after_first));
        assert!(std::ptr::eq(after_first, after_last));
    }

    #[test]
    fn test_remove() {
        let mut set = ShardSet::new();
        assert!(set.add(4));
        assert!(!set.add(4));
        assert!(set.remove(4));
        assert!(!set.remove(4));
        assert_eq!(set.cardinality(), 0);
    }
}
