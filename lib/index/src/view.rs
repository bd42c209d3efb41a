use std::collections::HashMap;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use itertools::Itertools;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;

use crate::broadcast::{Broadcaster, ClusterMessage};
use crate::engine::{BackendKind, StorageEngine};
use crate::error::{IndexError, IndexResult};
use crate::fragment::Fragment;
use crate::name::format_qualified_name;
use crate::qcx::{Qcx, TxOptions};
use crate::row::Row;
use crate::shard_set::{ShardSet, ShardSnapshotSource};
use crate::stats::StatsSink;
use crate::types::{
    CacheType, ColumnId, FieldType, RangeOp, RowId, ShardId, BSI_GROUP_VIEW_PREFIX, SHARD_WIDTH,
};

/// How long a shard-creating write waits for the peer broadcast before
/// returning; the send itself runs to completion regardless.
const CREATE_SHARD_BROADCAST_WAIT: Duration = Duration::from_millis(50);

const MIN_OPEN_WORKERS: usize = 4;

const FRAGMENTS_DIR: &str = "fragments";
const DIR_MODE: u32 = 0o750;

// Process-wide gate on concurrent fragment closes. Shutting down many views
// at once must not storm the fd and IO queues.
static FRAGMENT_CLOSE_QUEUE: Lazy<(Sender<()>, Receiver<()>)> =
    Lazy::new(|| bounded(2 * num_cpus::get()));

struct ClosePermit;

fn acquire_close_permit() -> ClosePermit {
    let _ = FRAGMENT_CLOSE_QUEUE.0.send(());
    ClosePermit
}

impl Drop for ClosePermit {
    fn drop(&mut self) {
        let _ = FRAGMENT_CLOSE_QUEUE.1.try_recv();
    }
}

#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub index: String,
    pub field: String,
    pub name: String,
    pub path: PathBuf,
    pub field_type: FieldType,
    pub cache_type: CacheType,
    pub cache_size: u32,
}

/// View - one layout of a field, holding a sparse set of shard fragments.
///
/// All mutable state lives behind a single reader/writer lock. The closing
/// flag is readable without the lock, as is the shard set's shared-out flag.
/// For every shard in the fragment map the known-shard set contains that
/// shard once open has returned.
pub struct View {
    index: String,
    field: String,
    name: String,
    path: PathBuf,
    field_type: FieldType,
    cache_type: CacheType,
    cache_size: u32,
    data: RwLock<ViewData>,
    closing: Arc<AtomicBool>,
    engine: Arc<dyn StorageEngine>,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<dyn StatsSink>,
}

#[derive(Default)]
struct ViewData {
    fragments: HashMap<ShardId, Arc<Fragment>>,
    known_shards: ShardSet,
}

impl View {
    pub fn new(
        config: ViewConfig,
        engine: Arc<dyn StorageEngine>,
        broadcaster: Arc<dyn Broadcaster>,
        stats: Arc<dyn StatsSink>,
    ) -> View {
        View {
            index: config.index,
            field: config.field,
            name: config.name,
            path: config.path,
            field_type: config.field_type,
            cache_type: config.cache_type,
            cache_size: config.cache_size,
            data: RwLock::new(ViewData::default()),
            closing: Arc::new(AtomicBool::new(false)),
            engine,
            broadcaster,
            stats,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    /// On-wire identifier of this view.
    pub fn qualified_name(&self) -> String {
        format_qualified_name(&self.index, &self.field, &self.name)
    }

    /// Create the view's directories without any fragments.
    pub fn open_empty(&mut self) -> IndexResult<()> {
        self.apply_cache_rule();
        if let Err(err) = self.create_dirs() {
            if let Err(close_err) = self.close() {
                log::error!("closing view after failed open: {close_err}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Open the view over a snapshot of known shards: a fragment per shard,
    /// opened concurrently, then the shard set populated.
    pub fn open_with_shard_set(&mut self, snapshot: &RoaringTreemap) -> IndexResult<()> {
        self.apply_cache_rule();
        self.create_dirs()?;

        let shards = snapshot.clone();
        let fragments = shards
            .iter()
            .map(|shard| (shard, Arc::new(self.new_fragment(shard))))
            .collect_vec();
        {
            let data = self.data.get_mut();
            for (shard, fragment) in &fragments {
                data.fragments.insert(*shard, Arc::clone(fragment));
            }
        }

        let open_list = fragments
            .iter()
            .map(|(_, fragment)| Arc::clone(fragment))
            .collect_vec();
        open_fragments_pooled(&open_list, open_pool_size(self.engine.kind()))?;

        let data = self.data.get_mut();
        for (shard, _) in &fragments {
            data.known_shards.add(*shard);
        }
        Ok(())
    }

    /// Open over the shard snapshot the source reports for this view.
    pub fn open_from_source(&mut self, source: &dyn ShardSnapshotSource) -> IndexResult<()> {
        let snapshot = source.available_shards(&self.index, &self.field, &self.name)?;
        self.open_with_shard_set(&snapshot)
    }

    /// Signal shutdown, then close every fragment through the global close
    /// queue. Returns the first fragment-close error; all fragments are
    /// attempted regardless.
    pub fn close(&self) -> IndexResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        let fragments = {
            let mut data = self.data.write();
            data.known_shards = ShardSet::new();
            data.fragments
                .drain()
                .map(|(_, fragment)| fragment)
                .collect_vec()
        };

        let mut first_err: Option<IndexError> = None;
        std::thread::scope(|scope| {
            let handles = fragments
                .iter()
                .map(|fragment| {
                    scope.spawn(move || {
                        let _permit = acquire_close_permit();
                        fragment.close()
                    })
                })
                .collect_vec();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    Err(_) => {
                        if first_err.is_none() {
                            first_err =
                                Some(IndexError::service_error("fragment close worker panicked"));
                        }
                    }
                }
            }
        });
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Shards known to contain data. The returned set is shared-out; treat
    /// it as immutable.
    pub fn available_shards(&self) -> Arc<RoaringTreemap> {
        self.data.read().known_shards.available()
    }

    pub fn fragment(&self, shard: ShardId) -> Option<Arc<Fragment>> {
        self.data.read().fragments.get(&shard).cloned()
    }

    pub fn all_fragments(&self) -> Vec<Arc<Fragment>> {
        self.data.read().fragments.values().cloned().collect_vec()
    }

    pub fn recalculate_caches(&self) {
        for fragment in self.all_fragments() {
            fragment.recalculate_cache();
        }
    }

    /// Persist every fragment's row cache. Aborts once the view starts
    /// closing; per-fragment errors are logged and swallowed.
    pub fn flush_caches(&self) {
        for fragment in self.all_fragments() {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = fragment.flush_cache() {
                log::error!(
                    "flushing cache for fragment {}/{}/{}/{}: {err}",
                    self.index,
                    self.field,
                    self.name,
                    fragment.shard()
                );
            }
        }
    }

    pub fn create_fragment_if_not_exists(&self, shard: ShardId) -> IndexResult<Arc<Fragment>> {
        let mut newly_known = false;
        let fragment = {
            let mut data = self.data.write();
            if self.closing.load(Ordering::SeqCst) {
                return Err(IndexError::ViewClosed);
            }
            if let Some(fragment) = data.fragments.get(&shard) {
                return Ok(Arc::clone(fragment));
            }
            let fragment = Arc::new(self.new_fragment(shard));
            fragment.open()?;
            data.fragments.insert(shard, Arc::clone(&fragment));
            newly_known = data.known_shards.add(shard);
            fragment
        };
        // Lock released; the broadcast must not hold up other writers.
        if newly_known {
            self.notify_shard_created(shard);
        }
        Ok(fragment)
    }

    pub fn delete_fragment(&self, shard: ShardId) -> IndexResult<()> {
        let mut data = self.data.write();
        let fragment = data
            .fragments
            .get(&shard)
            .cloned()
            .ok_or(IndexError::FragmentNotFound)?;
        fragment.close()?;
        self.engine.delete_fragment_from_store(&fragment)?;
        data.fragments.remove(&shard);
        data.known_shards.remove(shard);
        Ok(())
    }

    pub fn set_bit(&self, qcx: &Qcx, row: RowId, column: ColumnId) -> IndexResult<bool> {
        let shard = column / SHARD_WIDTH;
        let tx = qcx.get_tx(TxOptions {
            write: true,
            index: self.index.clone(),
            shard,
        })?;
        let fragment = self.create_fragment_if_not_exists(shard)?;
        let changed = fragment.set_bit(&tx, row, column)?;
        if changed {
            self.stats.count("setBit", 1);
        }
        Ok(changed)
    }

    pub fn clear_bit(&self, qcx: &Qcx, row: RowId, column: ColumnId) -> IndexResult<bool> {
        let shard = column / SHARD_WIDTH;
        let tx = qcx.get_tx(TxOptions {
            write: true,
            index: self.index.clone(),
            shard,
        })?;
        let Some(fragment) = self.fragment(shard) else {
            return Ok(false);
        };
        let changed = fragment.clear_bit(&tx, row, column)?;
        if changed {
            self.stats.count("clearBit", 1);
        }
        Ok(changed)
    }

    pub fn value(&self, qcx: &Qcx, column: ColumnId, bit_depth: u64) -> IndexResult<Option<i64>> {
        let shard = column / SHARD_WIDTH;
        let tx = qcx.get_tx(TxOptions {
            write: false,
            index: self.index.clone(),
            shard,
        })?;
        let Some(fragment) = self.fragment(shard) else {
            return Ok(None);
        };
        fragment.value(&tx, column, bit_depth)
    }

    pub fn set_value(
        &self,
        qcx: &Qcx,
        column: ColumnId,
        bit_depth: u64,
        value: i64,
    ) -> IndexResult<bool> {
        let shard = column / SHARD_WIDTH;
        let tx = qcx.get_tx(TxOptions {
            write: true,
            index: self.index.clone(),
            shard,
        })?;
        let fragment = self.create_fragment_if_not_exists(shard)?;
        let changed = fragment.set_value(&tx, column, bit_depth, value)?;
        if changed {
            self.stats.count("setValue", 1);
        }
        Ok(changed)
    }

    pub fn clear_value(&self, qcx: &Qcx, column: ColumnId, bit_depth: u64) -> IndexResult<bool> {
        let shard = column / SHARD_WIDTH;
        let tx = qcx.get_tx(TxOptions {
            write: true,
            index: self.index.clone(),
            shard,
        })?;
        let Some(fragment) = self.fragment(shard) else {
            return Ok(false);
        };
        let changed = fragment.clear_value(&tx, column, bit_depth)?;
        if changed {
            self.stats.count("clearValue", 1);
        }
        Ok(changed)
    }

    /// Union of one row across every fragment.
    pub fn row(&self, qcx: &Qcx, row_id: RowId) -> IndexResult<Row> {
        let mut out = Row::new();
        for fragment in self.all_fragments() {
            let tx = qcx.get_tx(TxOptions {
                write: false,
                index: self.index.clone(),
                shard: fragment.shard(),
            })?;
            out.union_with(&fragment.row(&tx, row_id)?);
        }
        Ok(out)
    }

    /// Union of a BSI range query across every fragment.
    pub fn range_op(
        &self,
        qcx: &Qcx,
        op: RangeOp,
        bit_depth: u64,
        predicate: i64,
    ) -> IndexResult<Row> {
        let mut out = Row::new();
        for fragment in self.all_fragments() {
            let tx = qcx.get_tx(TxOptions {
                write: false,
                index: self.index.clone(),
                shard: fragment.shard(),
            })?;
            out.union_with(&fragment.range_op(&tx, op, bit_depth, predicate)?);
        }
        Ok(out)
    }

    /// Per-shard duplicate-value detection, in parallel across fragments.
    /// Appending stops once the running column count exceeds `limit`
    /// (0 means unbounded).
    pub fn mutex_check(
        &self,
        qcx: &Qcx,
        limit: usize,
    ) -> IndexResult<HashMap<ShardId, HashMap<ColumnId, Vec<RowId>>>> {
        let fragments = self.all_fragments();
        if fragments.is_empty() {
            return Ok(HashMap::new());
        }

        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(ShardId, HashMap<ColumnId, Vec<RowId>>)>> =
            Mutex::new(Vec::new());
        let first_err: Mutex<Option<IndexError>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for _ in 0..num_cpus::get().min(fragments.len()) {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(fragment) = fragments.get(i) else {
                        break;
                    };
                    let result = qcx
                        .get_tx(TxOptions {
                            write: false,
                            index: self.index.clone(),
                            shard: fragment.shard(),
                        })
                        .and_then(|tx| fragment.mutex_check(&tx));
                    match result {
                        Ok(duplicates) => results.lock().push((fragment.shard(), duplicates)),
                        Err(err) => {
                            let mut slot = first_err.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        }
                    }
                });
            }
        });
        if let Some(err) = first_err.into_inner() {
            return Err(err);
        }

        let mut results = results.into_inner();
        results.sort_by_key(|(shard, _)| *shard);
        let mut out = HashMap::new();
        let mut columns = 0usize;
        for (shard, duplicates) in results {
            if duplicates.is_empty() {
                continue;
            }
            columns += duplicates.len();
            out.insert(shard, duplicates);
            if limit != 0 && columns > limit {
                break;
            }
        }
        Ok(out)
    }

    /// Maximum BSI bit depth over the requested shards; absent shards are
    /// skipped.
    pub fn bit_depth(&self, shards: &[ShardId]) -> IndexResult<u64> {
        let data = self.data.read();
        let mut max_depth = 0;
        for shard in shards {
            let Some(fragment) = data.fragments.get(shard) else {
                continue;
            };
            max_depth = max_depth.max(fragment.bit_depth()?);
        }
        Ok(max_depth)
    }

    // Emit the create-shard message to peers, waiting briefly so the common
    // case stays synchronous without letting a slow peer block the write
    // path.
    fn notify_shard_created(&self, shard: ShardId) {
        if self.broadcaster.peer_count() <= 1 {
            return;
        }
        let message = ClusterMessage::CreateShard {
            index: self.index.clone(),
            field: self.field.clone(),
            shard,
        };
        let broadcaster = Arc::clone(&self.broadcaster);
        let (done_tx, done_rx) = bounded::<()>(1);
        std::thread::spawn(move || {
            if let Err(err) = broadcaster.send_message(&message) {
                log::error!("broadcasting create-shard message: {err}");
            }
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv_timeout(CREATE_SHARD_BROADCAST_WAIT);
    }

    fn apply_cache_rule(&mut self) {
        if self.name.starts_with(BSI_GROUP_VIEW_PREFIX) {
            self.cache_type = CacheType::None;
        }
    }

    fn create_dirs(&self) -> IndexResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(self.fragments_path())?;
        Ok(())
    }

    fn fragments_path(&self) -> PathBuf {
        self.path.join(FRAGMENTS_DIR)
    }

    fn fragment_path(&self, shard: ShardId) -> PathBuf {
        self.fragments_path().join(shard.to_string())
    }

    fn new_fragment(&self, shard: ShardId) -> Fragment {
        Fragment::new(
            self.index.clone(),
            self.field.clone(),
            self.name.clone(),
            shard,
            self.fragment_path(shard),
            self.cache_type,
            self.cache_size,
        )
    }
}

fn open_pool_size(kind: BackendKind) -> usize {
    let threads = num_cpus::get();
    // Non-roaring engines open heavyweight transactions and gain nothing
    // from oversubscription.
    let workers = match kind {
        BackendKind::Roaring => threads,
        _ => threads / 4,
    };
    workers.max(MIN_OPEN_WORKERS)
}

fn open_fragments_pooled(fragments: &[Arc<Fragment>], workers: usize) -> IndexResult<()> {
    if fragments.is_empty() {
        return Ok(());
    }
    let next = AtomicUsize::new(0);
    let first_err: Mutex<Option<IndexError>> = Mutex::new(None);
    std::thread::scope(|scope| {
        for _ in 0..workers.min(fragments.len()) {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(fragment) = fragments.get(i) else {
                    break;
                };
                if let Err(err) = fragment.open() {
                    let mut slot = first_err.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }
    });
    match first_err.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
