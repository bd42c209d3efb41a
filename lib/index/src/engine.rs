use serde::{Deserialize, Serialize};

use crate::error::IndexResult;
use crate::fragment::Fragment;

/// Which engine backs fragment storage. Non-roaring engines open heavyweight
/// transactions, which changes how wide views fan out when opening fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Roaring,
    Bolt,
}

pub trait StorageEngine: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Remove a fragment's persisted data. Called after the fragment is
    /// closed, while the owning view still holds its write lock.
    fn delete_fragment_from_store(&self, fragment: &Fragment) -> IndexResult<()>;
}

/// The default engine: roaring bitmaps persisted one file per fragment.
#[derive(Debug, Default)]
pub struct RoaringEngine;

impl StorageEngine for RoaringEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Roaring
    }

    fn delete_fragment_from_store(&self, fragment: &Fragment) -> IndexResult<()> {
        fragment.drop_data()
    }
}
