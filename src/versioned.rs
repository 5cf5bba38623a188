//! In-memory typed versioned objects.

use std::any::Any;
use std::sync::Arc;

use tracing::error;

use crate::epoch::{Engine, Epoch};
use crate::error::{Result, UmbralError};
use crate::object::{Participant, Token};
use crate::sandbox::{LocalSlot, ObjKey};
use crate::table::{TableCell, VersionTable};
use crate::transaction::Transaction;

/// A value of type `T` with a full MVCC version history, living purely in
/// memory.
///
/// This is the default participant for values where every version can be
/// an independent copy. Reads are lock-free against the version table;
/// mutation buffers a private copy in the transaction's sandbox until
/// commit. Values whose versions should share structure implement
/// [`Participant`] directly instead.
pub struct Versioned<T: Clone + Send + Sync + 'static> {
    core: Arc<VersionedCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Versioned {
            core: self.core.clone(),
        }
    }
}

struct VersionedCore<T> {
    engine: Engine,
    cell: TableCell<T>,
    parent: Option<Arc<dyn Participant>>,
}

impl<T: Clone + Send + Sync + 'static> Versioned<T> {
    /// Creates a parentless versioned value holding `value`.
    pub fn new(engine: &Engine, value: T) -> Self {
        Self::build(engine, value, None)
    }

    /// Creates a versioned value that must commit before `parent`.
    pub fn with_parent(engine: &Engine, value: T, parent: Arc<dyn Participant>) -> Self {
        Self::build(engine, value, Some(parent))
    }

    fn build(engine: &Engine, value: T, parent: Option<Arc<dyn Participant>>) -> Self {
        Versioned {
            core: Arc::new(VersionedCore {
                engine: engine.clone(),
                cell: TableCell::new(VersionTable::initial(value)),
                parent,
            }),
        }
    }

    /// This object as a chain participant, e.g. to parent another object.
    pub fn as_participant(&self) -> Arc<dyn Participant> {
        self.core.clone()
    }

    fn key(&self) -> ObjKey {
        ObjKey::of_sized(&self.core)
    }

    /// The value visible to `tx`: its own speculative copy if it has one,
    /// otherwise the committed value at the transaction's epoch.
    pub fn read(&self, tx: &Transaction) -> Result<T> {
        match tx.sandbox().slot(self.key()) {
            Some(LocalSlot::Value(_)) => tx
                .sandbox()
                .value_ref::<T>(self.key())
                .cloned()
                .ok_or(UmbralError::WrongType),
            Some(LocalSlot::Removed) => Err(UmbralError::Removed),
            _ => Ok(self.core.cell.load().value_at_epoch(tx.epoch()).clone()),
        }
    }

    /// Mutable access to this transaction's private copy, materialized
    /// from the snapshot on first use.
    pub fn mutate<'t>(&self, tx: &'t mut Transaction) -> Result<&'t mut T> {
        let key = self.key();
        match tx.sandbox().slot(key) {
            Some(LocalSlot::Value(_)) => {}
            Some(LocalSlot::Removed) => return Err(UmbralError::Removed),
            _ => {
                let value = self.core.cell.load().value_at_epoch(tx.epoch()).clone();
                let obj: Arc<dyn Participant> = self.core.clone();
                tx.sandbox_mut().set_local_value(&obj, Some(Box::new(value)));
            }
        }
        tx.sandbox_mut()
            .value_mut::<T>(key)
            .ok_or(UmbralError::WrongType)
    }

    /// Replaces the value wholesale.
    pub fn write(&self, tx: &mut Transaction, value: T) -> Result<()> {
        *self.mutate(tx)? = value;
        Ok(())
    }

    /// Number of superseded versions still held in the table. Meaningful
    /// only while the engine is quiescent; cleanups shrink it.
    pub fn history_size(&self) -> usize {
        self.core.cell.load().len() - 1
    }
}

impl<T: Clone + Send + Sync + 'static> Participant for VersionedCore<T> {
    fn parent(&self) -> Option<Arc<dyn Participant>> {
        self.parent.clone()
    }

    fn check(&self, old_epoch: Epoch, _new_epoch: Epoch, _staged: Option<&(dyn Any + Send)>) -> bool {
        !self.cell.updated_since(old_epoch)
    }

    fn setup(
        &self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        staged: Option<&(dyn Any + Send)>,
    ) -> Option<Token> {
        debug_assert_eq!(
            new_epoch,
            self.engine.current_epoch() + 1,
            "epochs out of order"
        );
        let staged = match staged {
            Some(v) => v,
            None => {
                error!("in-memory versioned object staged a removal");
                panic!("removal staged for an in-memory versioned object");
            }
        };
        let value = match staged.downcast_ref::<T>() {
            Some(v) => v.clone(),
            None => {
                error!("staged value has an unexpected type");
                panic!("staged value has an unexpected type");
            }
        };
        if self.cell.stage(&self.engine, old_epoch, new_epoch, value) {
            Some(Token::noop())
        } else {
            None
        }
    }

    fn commit(self: Arc<Self>, _new_epoch: Epoch, _token: Token) {
        // The previously current version just became history; schedule it
        // for removal once nothing can observe it.
        let valid_from = self.cell.load().cleanup_lower_bound();
        let engine = self.engine.clone();
        engine.register_cleanup(self, valid_from);
    }

    fn rollback(&self, _new_epoch: Epoch, _staged: Option<&(dyn Any + Send)>, _token: Token) {
        self.cell.unstage(&self.engine);
    }

    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) {
        if !self.cell.remove_version(&self.engine, unused_valid_from) {
            error!(
                unused_valid_from,
                trigger_epoch, "version to clean up does not exist"
            );
            panic!("cleanup target missing");
        }
    }

    fn rename_epoch(&self, old_valid_from: Epoch, new_valid_from: Epoch) -> Epoch {
        match self.cell.relabel(&self.engine, old_valid_from, new_valid_from) {
            Some(neighbor) => neighbor,
            None => {
                error!(old_valid_from, new_valid_from, "rename target does not exist");
                panic!("rename target missing");
            }
        }
    }
}
