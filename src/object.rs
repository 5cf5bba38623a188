//! The versioned-object contract every MVCC participant implements.
//!
//! The engine never looks inside a participant's values: speculative state
//! travels through the sandbox as type-erased boxes, and `setup` hands back
//! an opaque [`Token`] that the same walk later feeds to `commit` or
//! `rollback`.

use std::any::Any;
use std::sync::Arc;

use crate::epoch::Epoch;

/// A speculative value owned by the transaction sandbox.
pub type LocalValue = Box<dyn Any + Send>;

/// Opaque per-object state produced by [`Participant::setup`] and consumed
/// by exactly one of [`Participant::commit`] or [`Participant::rollback`].
pub struct Token(pub(crate) TokenKind);

#[derive(Debug)]
pub(crate) enum TokenKind {
    /// Nothing beyond the version table was staged.
    InMemory,
    /// The object was removed; `old_offset` holds the on-disk bytes to
    /// reclaim once no snapshot can reach them.
    Removed { old_offset: Option<u64> },
    /// A staged value was serialized into the arena at `new_offset`;
    /// `old_offset` is the serialization it supersedes.
    Value { new_offset: u64, old_offset: Option<u64> },
    /// A manager directory was serialized into the arena at `new_offset`.
    Directory { new_offset: u64 },
}

impl Token {
    /// Token for participants with no external state to finalize.
    pub fn noop() -> Self {
        Token(TokenKind::InMemory)
    }
}

/// The eight-operation capability set of a versioned object.
///
/// `check`/`setup`/`commit`/`rollback` are invoked by the sandbox's commit
/// walk, in chain order (descendants before ancestors). `cleanup` and
/// `rename_epoch` are invoked by the snapshot registry once a historical
/// version can no longer be observed. None of these operations may fail
/// other than in the ways their signatures express: `check` and `setup`
/// report conflicts by returning `false`/`None`, everything else must
/// succeed or panic on a broken invariant.
pub trait Participant: Send + Sync {
    /// The object that must commit after (and be torn down after) this one.
    ///
    /// Parent links form a DAG used only for commit ordering.
    fn parent(&self) -> Option<Arc<dyn Participant>>;

    /// Fast pre-flight run before the commit mutex is taken. May return a
    /// false positive (`setup` can still fail) but never a false negative.
    /// Must not modify anything.
    fn check(
        &self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        staged: Option<&(dyn Any + Send)>,
    ) -> bool;

    /// Attempt to stage the speculative value into the version table and
    /// any external store. `staged` is `None` for a removal. Returning
    /// `None` signals failure and aborts the commit.
    fn setup(
        &self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        staged: Option<&(dyn Any + Send)>,
    ) -> Option<Token>;

    /// Finalize a successful `setup`. Must not fail. Runs after the epoch
    /// has been advanced, so the staged version is already current.
    fn commit(self: Arc<Self>, new_epoch: Epoch, token: Token);

    /// Undo a successful `setup`. Must not fail.
    fn rollback(
        &self,
        new_epoch: Epoch,
        staged: Option<&(dyn Any + Send)>,
        token: Token,
    );

    /// Remove the historical version whose lower bound is
    /// `unused_valid_from`. Panics if no such version exists.
    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch);

    /// Relabel the version previously valid from `old_valid_from` to begin
    /// at `new_valid_from`. Returns the following neighbor's lower bound,
    /// or 0 when the relabeled version borders the current value.
    fn rename_epoch(&self, old_valid_from: Epoch, new_valid_from: Epoch) -> Epoch;

    /// Dispose of a speculative value the sandbox still owns at teardown.
    fn destroy_local_value(&self, value: LocalValue) {
        drop(value);
    }
}
