//! Persistent typed versioned objects and their user-facing handles.

use std::any::Any;
use std::sync::{Arc, Weak};

use tracing::{error, warn};

use crate::epoch::{Engine, Epoch};
use crate::error::{Result, UmbralError};
use crate::object::{Participant, Token, TokenKind};
use crate::sandbox::{LocalSlot, ObjKey};
use crate::store::manager::ObjectId;
use crate::store::persist::Persist;
use crate::store::StoreInner;
use crate::table::{TableCell, VersionTable};
use crate::transaction::Transaction;

/// Type-erasure seam for directory slots: every persistent object is a
/// participant that can also surrender itself for a typed downcast.
pub(crate) trait AnyPvo: Participant {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A persistent object: a version table of shared values, owned by the
/// store's directory, serialized through the [`Persist`] seam on commit.
pub(crate) struct TypedPvo<T: Persist> {
    id: ObjectId,
    engine: Engine,
    store: Weak<StoreInner>,
    cell: TableCell<Arc<T>>,
}

impl<T: Persist> TypedPvo<T> {
    pub fn new(id: ObjectId, engine: Engine, store: Weak<StoreInner>, value: T) -> Arc<Self> {
        Arc::new(TypedPvo {
            id,
            engine,
            store,
            cell: TableCell::new(VersionTable::initial(Arc::new(value))),
        })
    }

    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or_else(|| UmbralError::InvalidArgument("store was closed".into()))
    }

    /// Queues the superseded serialization for reclamation once nothing
    /// can reconstitute from it.
    fn defer_deallocate(&self, offset: u64) {
        let store = self.store.clone();
        self.engine.defer(Box::new(move || {
            if let Some(store) = store.upgrade() {
                if let Err(err) = T::deallocate(&store.arena, offset) {
                    warn!(%err, offset, "deferred deallocation failed");
                }
            }
        }));
    }
}

impl<T: Persist> Participant for TypedPvo<T> {
    fn parent(&self) -> Option<Arc<dyn Participant>> {
        // The owning directory must commit after this object.
        self.store
            .upgrade()
            .map(|store| store.root().clone() as Arc<dyn Participant>)
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
        let store = match self.store.upgrade() {
            Some(store) => store,
            None => {
                error!("store closed while a commit was in flight");
                return None;
            }
        };
        let staged = match staged {
            None => {
                // Removal: the slot was already vacated in the sandboxed
                // directory; remember which bytes to reclaim.
                let old_offset = store.root().committed_offset(self.id, old_epoch);
                return Some(Token(TokenKind::Removed { old_offset }));
            }
            Some(any) => any,
        };
        let value = match staged.downcast_ref::<T>() {
            Some(value) => Arc::new(value.clone()),
            None => {
                error!("staged value has an unexpected type");
                panic!("staged value has an unexpected type");
            }
        };
        let new_offset = match value.serialize(&store.arena) {
            Ok(offset) => offset,
            Err(err) => {
                // Exhaustion surfaces as a failed commit, not an error.
                warn!(%err, "serialization failed during setup");
                return None;
            }
        };
        if !self.cell.stage(&self.engine, old_epoch, new_epoch, value) {
            if let Err(err) = T::deallocate(&store.arena, new_offset) {
                warn!(%err, "could not reclaim conflicted staged bytes");
            }
            return None;
        }
        let old_offset = store
            .root()
            .set_persistent_version(self.id, new_offset, old_epoch);
        Some(Token(TokenKind::Value {
            new_offset,
            old_offset,
        }))
    }

    fn commit(self: Arc<Self>, _new_epoch: Epoch, token: Token) {
        match token.0 {
            TokenKind::Removed { old_offset } => {
                if let Some(offset) = old_offset {
                    self.defer_deallocate(offset);
                }
            }
            TokenKind::Value { old_offset, .. } => {
                let valid_from = self.cell.load().cleanup_lower_bound();
                let engine = self.engine.clone();
                let this = self.clone();
                engine.register_cleanup(this, valid_from);
                if let Some(offset) = old_offset {
                    self.defer_deallocate(offset);
                }
            }
            TokenKind::InMemory | TokenKind::Directory { .. } => {
                error!("persistent object commit consumed a foreign token");
                panic!("unexpected token kind at commit");
            }
        }
    }

    fn rollback(&self, _new_epoch: Epoch, _staged: Option<&(dyn Any + Send)>, token: Token) {
        match token.0 {
            TokenKind::Removed { .. } => {}
            TokenKind::Value { new_offset, .. } => {
                self.cell.unstage(&self.engine);
                if let Some(store) = self.store.upgrade() {
                    store.root().unrecord_offset(self.id);
                    // Never published; reclaim inline.
                    if let Err(err) = T::deallocate(&store.arena, new_offset) {
                        warn!(%err, "could not reclaim rolled-back bytes");
                    }
                }
            }
            TokenKind::InMemory | TokenKind::Directory { .. } => {
                error!("persistent object rollback consumed a foreign token");
                panic!("unexpected token kind at rollback");
            }
        }
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

impl<T: Persist> AnyPvo for TypedPvo<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Cheap cloneable reference to a persistent object.
///
/// The strong reference lives in the store's directory; handles merely
/// share it. A handle obtained before another transaction removed the
/// object keeps reading the historical versions its snapshot allows —
/// fresh lookups of the removed id fail instead.
pub struct Handle<T: Persist> {
    pvo: Arc<TypedPvo<T>>,
}

impl<T: Persist> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            pvo: self.pvo.clone(),
        }
    }
}

impl<T: Persist> Handle<T> {
    pub(crate) fn new(pvo: Arc<TypedPvo<T>>) -> Self {
        Handle { pvo }
    }

    pub(crate) fn downcast(live: Arc<dyn AnyPvo>) -> Result<Self> {
        live.as_any()
            .downcast::<TypedPvo<T>>()
            .map(Handle::new)
            .map_err(|_| UmbralError::WrongType)
    }

    fn key(&self) -> ObjKey {
        ObjKey::of_sized(&self.pvo)
    }

    /// The object's stable id within its store.
    pub fn id(&self) -> ObjectId {
        self.pvo.id
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
            _ => Ok(self
                .pvo
                .cell
                .load()
                .value_at_epoch(tx.epoch())
                .as_ref()
                .clone()),
        }
    }

    /// Mutable access to this transaction's private copy, materialized
    /// from the snapshot on first use. Marks the owning directory mutated
    /// so it reserializes after this object commits.
    pub fn mutate<'t>(&self, tx: &'t mut Transaction) -> Result<&'t mut T> {
        let store = self.pvo.store()?;
        store.root().ensure_local(tx)?;
        let key = self.key();
        match tx.sandbox().slot(key) {
            Some(LocalSlot::Value(_)) => {}
            Some(LocalSlot::Removed) => return Err(UmbralError::Removed),
            _ => {
                let value = self
                    .pvo
                    .cell
                    .load()
                    .value_at_epoch(tx.epoch())
                    .as_ref()
                    .clone();
                let obj: Arc<dyn Participant> = self.pvo.clone();
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

    /// Marks the object removed in `tx`; the id becomes invalid once the
    /// transaction commits. Removing twice in one transaction is misuse.
    pub fn remove(&self, tx: &mut Transaction) -> Result<()> {
        let store = self.pvo.store()?;
        let root = store.root().clone();
        root.ensure_local(tx)?;
        if matches!(tx.sandbox().slot(self.key()), Some(LocalSlot::Removed)) {
            return Err(UmbralError::Removed);
        }
        root.vacate(tx, self.pvo.id)?;
        let obj: Arc<dyn Participant> = self.pvo.clone();
        let prior = tx.sandbox_mut().set_local_value(&obj, None);
        drop(prior);
        Ok(())
    }

    /// Number of superseded versions still held in memory. Meaningful only
    /// while the engine is quiescent.
    pub fn history_size(&self) -> usize {
        self.pvo.cell.load().len() - 1
    }
}
