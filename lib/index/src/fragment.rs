use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};
use crate::qcx::Tx;
use crate::row::Row;
use crate::types::{CacheType, ColumnId, RangeOp, RowId, ShardId, SHARD_WIDTH};

/// Row carrying the not-null bit of every BSI column.
pub const BSI_EXISTS_ROW: RowId = 0;
/// Row carrying the sign bit of negative BSI values.
pub const BSI_SIGN_ROW: RowId = 1;
/// First magnitude bit-plane row of a BSI view.
pub const BSI_OFFSET_ROW: RowId = 2;

const CACHE_FILE_SUFFIX: &str = "cache";

/// Fragment - the storage unit for one shard of one (index, field, view).
///
/// - Holds bitmap data as packed `row * SHARD_WIDTH + column` positions
/// - Persists to a single file, with a row-cache sidecar next to it
/// - Owned by exactly one view; opened once, closed once, never reopened
pub struct Fragment {
    index: String,
    field: String,
    view: String,
    shard: ShardId,
    path: PathBuf,
    cache_type: CacheType,
    cache_size: u32,
    state: RwLock<FragmentState>,
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("index", &self.index)
            .field("field", &self.field)
            .field("view", &self.view)
            .field("shard", &self.shard)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct FragmentState {
    storage: RoaringTreemap,
    cache: RowCache,
    open: bool,
}

/// Cardinality cache of the hottest rows. Counts are maintained on writes
/// and trimmed to the configured size on flush.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RowCache {
    #[serde(default)]
    entries: HashMap<RowId, CacheEntry>,
    #[serde(skip)]
    tick: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CacheEntry {
    count: u64,
    touched: u64,
}

impl RowCache {
    fn update(&mut self, row: RowId, delta: i64) {
        self.tick += 1;
        let tick = self.tick;
        let entry = self
            .entries
            .entry(row)
            .or_insert(CacheEntry { count: 0, touched: 0 });
        entry.count = entry.count.saturating_add_signed(delta);
        entry.touched = tick;
        if entry.count == 0 {
            self.entries.remove(&row);
        }
    }

    fn rebuild(&mut self, counts: HashMap<RowId, u64>) {
        self.tick += 1;
        let tick = self.tick;
        self.entries = counts
            .into_iter()
            .map(|(row, count)| (row, CacheEntry { count, touched: tick }))
            .collect();
    }

    fn trim(&mut self, cache_type: CacheType, cache_size: u32) {
        let limit = cache_size as usize;
        if limit == 0 || self.entries.len() <= limit {
            return;
        }
        let mut ordered: Vec<(RowId, CacheEntry)> = self
            .entries
            .iter()
            .map(|(&row, &entry)| (row, entry))
            .collect();
        match cache_type {
            CacheType::Ranked => {
                ordered.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)))
            }
            CacheType::Lru | CacheType::None => {
                ordered.sort_by(|a, b| b.1.touched.cmp(&a.1.touched))
            }
        }
        ordered.truncate(limit);
        self.entries = ordered.into_iter().collect();
    }
}

impl Fragment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: impl Into<String>,
        field: impl Into<String>,
        view: impl Into<String>,
        shard: ShardId,
        path: PathBuf,
        cache_type: CacheType,
        cache_size: u32,
    ) -> Fragment {
        Fragment {
            index: index.into(),
            field: field.into(),
            view: view.into(),
            shard,
            path,
            cache_type,
            cache_size,
            state: RwLock::new(FragmentState::default()),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_path(&self) -> PathBuf {
        self.path.with_extension(CACHE_FILE_SUFFIX)
    }

    /// Load persisted data, if any. A fragment is opened exactly once.
    pub fn open(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.open {
            return Err(IndexError::service_error(format!(
                "fragment {}/{}/{}/{} already open",
                self.index, self.field, self.view, self.shard
            )));
        }
        if self.path.exists() {
            let file = File::open(&self.path)?;
            state.storage = RoaringTreemap::deserialize_from(BufReader::new(file)).map_err(
                |err| {
                    IndexError::service_error(format!(
                        "reading fragment {}: {err}",
                        self.path.display()
                    ))
                },
            )?;
        }
        let cache_path = self.cache_path();
        if self.cache_type != CacheType::None && cache_path.exists() {
            let file = File::open(&cache_path)?;
            state.cache = serde_json::from_reader(BufReader::new(file))?;
        }
        state.open = true;
        Ok(())
    }

    /// Flush and release. Further operations fail; a closed fragment is
    /// never reopened.
    pub fn close(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(IndexError::FragmentClosed);
        }
        Self::write_storage(&self.path, &state.storage)?;
        if self.cache_type != CacheType::None {
            state.cache.trim(self.cache_type, self.cache_size);
            Self::write_cache(&self.cache_path(), &state.cache)?;
        }
        state.open = false;
        Ok(())
    }

    /// Remove the persisted files. The fragment must already be closed.
    pub fn drop_data(&self) -> IndexResult<()> {
        let cache_path = self.cache_path();
        for path in [&self.path, &cache_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn set_bit(&self, tx: &Tx, row: RowId, column: ColumnId) -> IndexResult<bool> {
        Self::ensure_writable(tx)?;
        let mut state = self.state.write();
        Self::ensure_open(&state)?;
        let changed = state.storage.insert(self.position(row, column));
        if changed && self.cache_type != CacheType::None {
            state.cache.update(row, 1);
        }
        Ok(changed)
    }

    pub fn clear_bit(&self, tx: &Tx, row: RowId, column: ColumnId) -> IndexResult<bool> {
        Self::ensure_writable(tx)?;
        let mut state = self.state.write();
        Self::ensure_open(&state)?;
        let changed = state.storage.remove(self.position(row, column));
        if changed && self.cache_type != CacheType::None {
            state.cache.update(row, -1);
        }
        Ok(changed)
    }

    /// Columns of one row, as absolute column IDs.
    pub fn row(&self, _tx: &Tx, row: RowId) -> IndexResult<Row> {
        let state = self.state.read();
        Self::ensure_open(&state)?;
        let start = row * SHARD_WIDTH;
        let end = start + SHARD_WIDTH;
        let base = self.shard * SHARD_WIDTH;
        Ok(Row::from_columns(
            state
                .storage
                .iter()
                .skip_while(|&pos| pos < start)
                .take_while(|&pos| pos < end)
                .map(|pos| base + (pos - start)),
        ))
    }

    pub fn set_value(
        &self,
        tx: &Tx,
        column: ColumnId,
        bit_depth: u64,
        value: i64,
    ) -> IndexResult<bool> {
        Self::ensure_writable(tx)?;
        let mut state = self.state.write();
        Self::ensure_open(&state)?;
        let mut changed = state.storage.insert(self.position(BSI_EXISTS_ROW, column));
        if value < 0 {
            changed |= state.storage.insert(self.position(BSI_SIGN_ROW, column));
        } else {
            changed |= state.storage.remove(self.position(BSI_SIGN_ROW, column));
        }
        let magnitude = value.unsigned_abs();
        for bit in 0..bit_depth {
            let position = self.position(BSI_OFFSET_ROW + bit, column);
            if magnitude & (1 << bit) != 0 {
                changed |= state.storage.insert(position);
            } else {
                changed |= state.storage.remove(position);
            }
        }
        Ok(changed)
    }

    pub fn clear_value(&self, tx: &Tx, column: ColumnId, bit_depth: u64) -> IndexResult<bool> {
        Self::ensure_writable(tx)?;
        let mut state = self.state.write();
        Self::ensure_open(&state)?;
        let mut changed = state.storage.remove(self.position(BSI_EXISTS_ROW, column));
        changed |= state.storage.remove(self.position(BSI_SIGN_ROW, column));
        for bit in 0..bit_depth {
            changed |= state
                .storage
                .remove(self.position(BSI_OFFSET_ROW + bit, column));
        }
        Ok(changed)
    }

    pub fn value(&self, _tx: &Tx, column: ColumnId, bit_depth: u64) -> IndexResult<Option<i64>> {
        let state = self.state.read();
        Self::ensure_open(&state)?;
        if !state.storage.contains(self.position(BSI_EXISTS_ROW, column)) {
            return Ok(None);
        }
        Ok(Some(self.value_at(&state, column % SHARD_WIDTH, bit_depth)))
    }

    /// Columns whose BSI value satisfies `op` against the predicate.
    pub fn range_op(
        &self,
        _tx: &Tx,
        op: RangeOp,
        bit_depth: u64,
        predicate: i64,
    ) -> IndexResult<Row> {
        let state = self.state.read();
        Self::ensure_open(&state)?;
        let base = self.shard * SHARD_WIDTH;
        let mut row = Row::new();
        // Positions below SHARD_WIDTH are the exists row.
        for offset in state.storage.iter().take_while(|&pos| pos < SHARD_WIDTH) {
            let value = self.value_at(&state, offset, bit_depth);
            if op.matches(value, predicate) {
                row.set(base + offset);
            }
        }
        Ok(row)
    }

    /// Columns carrying more than one bit, with the rows they carry. Mutex
    /// fields allow at most one row per column; anything else is a
    /// consistency violation for the caller to report.
    pub fn mutex_check(&self, _tx: &Tx) -> IndexResult<HashMap<ColumnId, Vec<RowId>>> {
        let state = self.state.read();
        Self::ensure_open(&state)?;
        let base = self.shard * SHARD_WIDTH;
        let mut rows_by_column: HashMap<ColumnId, Vec<RowId>> = HashMap::new();
        for pos in state.storage.iter() {
            rows_by_column
                .entry(base + pos % SHARD_WIDTH)
                .or_default()
                .push(pos / SHARD_WIDTH);
        }
        rows_by_column.retain(|_, rows| rows.len() > 1);
        Ok(rows_by_column)
    }

    /// Number of BSI magnitude planes in use.
    pub fn bit_depth(&self) -> IndexResult<u64> {
        let state = self.state.read();
        Self::ensure_open(&state)?;
        let max_row = state.storage.max().map_or(0, |pos| pos / SHARD_WIDTH);
        Ok(if max_row >= BSI_OFFSET_ROW {
            max_row - BSI_OFFSET_ROW + 1
        } else {
            0
        })
    }

    /// Persist the row cache sidecar.
    pub fn flush_cache(&self) -> IndexResult<()> {
        if self.cache_type == CacheType::None {
            return Ok(());
        }
        let mut state = self.state.write();
        Self::ensure_open(&state)?;
        state.cache.trim(self.cache_type, self.cache_size);
        Self::write_cache(&self.cache_path(), &state.cache)
    }

    /// Rebuild the row cache from storage.
    pub fn recalculate_cache(&self) {
        if self.cache_type == CacheType::None {
            return;
        }
        let mut state = self.state.write();
        if !state.open {
            return;
        }
        let mut counts: HashMap<RowId, u64> = HashMap::new();
        for pos in state.storage.iter() {
            *counts.entry(pos / SHARD_WIDTH).or_default() += 1;
        }
        state.cache.rebuild(counts);
        state.cache.trim(self.cache_type, self.cache_size);
    }

    /// Cached row cardinalities, largest first. Test observability.
    pub fn cached_row_counts(&self) -> Vec<(RowId, u64)> {
        let state = self.state.read();
        let mut counts: Vec<(RowId, u64)> = state
            .cache
            .entries
            .iter()
            .map(|(&row, entry)| (row, entry.count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts
    }

    fn position(&self, row: RowId, column: ColumnId) -> u64 {
        row * SHARD_WIDTH + (column % SHARD_WIDTH)
    }

    fn value_at(&self, state: &FragmentState, offset: u64, bit_depth: u64) -> i64 {
        let mut magnitude: i64 = 0;
        for bit in 0..bit_depth {
            if state
                .storage
                .contains((BSI_OFFSET_ROW + bit) * SHARD_WIDTH + offset)
            {
                magnitude |= 1 << bit;
            }
        }
        if state.storage.contains(BSI_SIGN_ROW * SHARD_WIDTH + offset) {
            -magnitude
        } else {
            magnitude
        }
    }

    fn ensure_open(state: &FragmentState) -> IndexResult<()> {
        if !state.open {
            return Err(IndexError::FragmentClosed);
        }
        Ok(())
    }

    fn ensure_writable(tx: &Tx) -> IndexResult<()> {
        if !tx.writable() {
            return Err(IndexError::service_error(
                "write operation on read transaction",
            ));
        }
        Ok(())
    }

    fn write_storage(path: &Path, storage: &RoaringTreemap) -> IndexResult<()> {
        AtomicFile::new(path, AllowOverwrite).write(|file| storage.serialize_into(file))?;
        Ok(())
    }

    fn write_cache(path: &Path, cache: &RowCache) -> IndexResult<()> {
        AtomicFile::new(path, AllowOverwrite)
            .write(|file| serde_json::to_writer(file, cache))?;
        Ok(())
    }
}
