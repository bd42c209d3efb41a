use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::IndexResult;
use crate::types::ShardId;

/// Options for acquiring a per-shard transaction.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub write: bool,
    pub index: String,
    pub shard: ShardId,
}

/// A per-shard transaction handle. The in-process engine needs no state
/// beyond the declared intent; heavier engines hang their cursors off this.
#[derive(Debug)]
pub struct Tx {
    write: bool,
    shard: ShardId,
}

impl Tx {
    pub fn writable(&self) -> bool {
        self.write
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }
}

#[derive(Debug, Default)]
struct QcxState {
    outstanding: usize,
    acquired: u64,
}

/// Query context: dispenses per-shard read or write transactions. Guards
/// release on drop, so every exit path of an operation finishes its
/// transaction.
#[derive(Debug, Default)]
pub struct Qcx {
    state: Arc<Mutex<QcxState>>,
}

impl Qcx {
    pub fn new() -> Qcx {
        Qcx::default()
    }

    pub fn get_tx(&self, options: TxOptions) -> IndexResult<TxGuard> {
        let mut state = self.state.lock();
        state.outstanding += 1;
        state.acquired += 1;
        Ok(TxGuard {
            tx: Tx {
                write: options.write,
                shard: options.shard,
            },
            state: Arc::clone(&self.state),
        })
    }

    /// Transactions currently held open.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Total transactions handed out over the lifetime of this context.
    pub fn acquired(&self) -> u64 {
        self.state.lock().acquired
    }
}

pub struct TxGuard {
    tx: Tx,
    state: Arc<Mutex<QcxState>>,
}

impl Deref for TxGuard {
    type Target = Tx;

    fn deref(&self) -> &Tx {
        &self.tx
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        self.state.lock().outstanding -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let qcx = Qcx::new();
        {
            let tx = qcx
                .get_tx(TxOptions {
                    write: true,
                    index: "i".into(),
                    shard: 3,
                })
                .unwrap();
            assert!(tx.writable());
            assert_eq!(tx.shard(), 3);
            assert_eq!(qcx.outstanding(), 1);
        }
        assert_eq!(qcx.outstanding(), 0);
        assert_eq!(qcx.acquired(), 1);
    }
}
