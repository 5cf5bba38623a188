//! Scoped, snapshot-isolated transactions.

use crate::epoch::{Engine, Epoch};
use crate::sandbox::Sandbox;

/// A snapshot-isolated unit of work.
///
/// A transaction pins the epoch current at [`Engine::begin`]; every read
/// through it observes that epoch until the transaction itself overwrites
/// the value. Mutations accumulate in the transaction's sandbox and only
/// become visible through [`Transaction::commit`]. Dropping a transaction
/// without committing discards the sandbox (children before parents) and
/// releases the snapshot.
pub struct Transaction {
    engine: Engine,
    epoch: Epoch,
    sandbox: Sandbox,
}

impl Engine {
    /// Begins a transaction reading at the current epoch.
    pub fn begin(&self) -> Transaction {
        let epoch = self.register_snapshot();
        Transaction {
            engine: self.clone(),
            epoch,
            sandbox: Sandbox::default(),
        }
    }
}

impl Transaction {
    /// The epoch this transaction reads at.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Number of objects this transaction has touched.
    pub fn touched(&self) -> usize {
        self.sandbox.len()
    }

    /// Atomically publishes the buffered writes.
    ///
    /// Returns `false` when the transaction lost the race to a concurrent
    /// committer; the speculative values are discarded either way and the
    /// caller decides whether to retry with a fresh transaction. A
    /// read-only transaction commits trivially.
    pub fn commit(mut self) -> bool {
        let epoch = self.epoch;
        self.sandbox.commit(&self.engine, epoch).is_some()
    }

    pub(crate) fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub(crate) fn sandbox_mut(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.sandbox.clear();
        self.engine.release_snapshot(self.epoch);
    }
}
