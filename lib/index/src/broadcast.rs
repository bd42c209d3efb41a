use serde::{Deserialize, Serialize};

use crate::error::IndexResult;
use crate::types::ShardId;

/// Messages exchanged between cluster peers about index topology. The wire
/// encoding and transport belong to the cluster layer; views only construct
/// and hand off the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClusterMessage {
    CreateShard {
        index: String,
        field: String,
        shard: ShardId,
    },
}

/// Capability to notify cluster peers. Two variants exist in practice: the
/// multi-node cluster sender, and the no-op below for single-node processes.
pub trait Broadcaster: Send + Sync {
    /// Send the message to peers, or spool it for later delivery.
    fn send_message(&self, message: &ClusterMessage) -> IndexResult<()>;

    /// Number of nodes in the cluster, including this one.
    fn peer_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn send_message(&self, _message: &ClusterMessage) -> IndexResult<()> {
        Ok(())
    }

    fn peer_count(&self) -> usize {
        1
    }
}
