use serde::{Deserialize, Serialize};

pub type ShardId = u64;
pub type RowId = u64;
pub type ColumnId = u64;

/// Width of the contiguous column range covered by one shard.
pub const SHARD_WIDTH: u64 = 1 << 20;

/// Cluster-wide number of key-translation partitions.
pub const DEFAULT_PARTITION_N: usize = 256;

/// Name of the default layout view of a field.
pub const STANDARD_VIEW: &str = "standard";

/// Prefix of the bit-sliced group views; these never carry a row cache.
pub const BSI_GROUP_VIEW_PREFIX: &str = "bsig_";

/// View name holding the bit-sliced data of an integer field.
pub fn bsi_group_view_name(field: &str) -> String {
    format!("{BSI_GROUP_VIEW_PREFIX}{field}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Set,
    Int,
    Mutex,
    Bool,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Ranked,
    Lru,
    None,
}

/// Comparison applied to BSI values by a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RangeOp {
    pub fn matches(&self, value: i64, predicate: i64) -> bool {
        match self {
            RangeOp::Eq => value == predicate,
            RangeOp::Ne => value != predicate,
            RangeOp::Lt => value < predicate,
            RangeOp::Le => value <= predicate,
            RangeOp::Gt => value > predicate,
            RangeOp::Ge => value >= predicate,
        }
    }
}
