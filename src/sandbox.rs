//! Transaction-local buffer of speculative writes.
//!
//! The sandbox maps each touched participant to its speculative value and
//! keeps every entry on an intrusive chain ordered so that descendants
//! come before their ancestors. Inserting an object first inserts its
//! whole parent chain; objects pulled in only for ordering are marked
//! automatic and skipped by the commit walk. The chain order is what makes
//! the commit protocol correct: children stage, publish and tear down
//! before the managers that own them.

use std::any::Any;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::epoch::{Engine, Epoch};
use crate::object::{LocalValue, Participant, Token};

/// Identity key of a participant: the address of its shared state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ObjKey(usize);

impl ObjKey {
    pub fn of(obj: &Arc<dyn Participant>) -> Self {
        ObjKey(Arc::as_ptr(obj) as *const () as usize)
    }

    /// Same identity, computed without building a trait-object Arc first.
    pub fn of_sized<T>(obj: &Arc<T>) -> Self {
        ObjKey(Arc::as_ptr(obj) as *const () as usize)
    }

    /// Identity of an object already behind its Arc; `Arc::as_ptr` and a
    /// reference to the pointee agree on the address.
    pub fn of_obj<T>(obj: &T) -> Self {
        ObjKey(obj as *const T as *const () as usize)
    }
}

/// What the sandbox holds for one participant.
pub(crate) enum LocalSlot {
    /// Inserted only to keep the parent chain complete.
    Automatic,
    /// Speculative value owned by the sandbox.
    Value(LocalValue),
    /// The object is removed in this transaction.
    Removed,
}

impl LocalSlot {
    /// The staged value as the commit walk passes it: `None` both for a
    /// removal and (unreachably) for automatic entries.
    fn staged(&self) -> Option<&(dyn Any + Send)> {
        match self {
            LocalSlot::Value(v) => Some(&**v),
            _ => None,
        }
    }

    fn is_automatic(&self) -> bool {
        matches!(self, LocalSlot::Automatic)
    }
}

struct SandboxEntry {
    obj: Arc<dyn Participant>,
    slot: LocalSlot,
    prev: Option<ObjKey>,
    next: Option<ObjKey>,
}

/// Per-transaction ordered map of object → speculative value.
#[derive(Default)]
pub(crate) struct Sandbox {
    entries: FxHashMap<ObjKey, SandboxEntry>,
    head: Option<ObjKey>,
    tail: Option<ObjKey>,
}

impl Sandbox {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn num_automatic(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.slot.is_automatic())
            .count()
    }

    /// Inserts `obj` (and, first, its whole parent chain), splicing it
    /// into the traversal chain directly before its parent, or at the tail
    /// when it has none. Existing entries are returned as-is.
    pub fn insert(&mut self, obj: &Arc<dyn Participant>) -> ObjKey {
        let key = ObjKey::of(obj);
        if self.entries.contains_key(&key) {
            return key;
        }

        let parent = obj.parent();
        let parent_key = parent.as_ref().map(|p| self.insert(p));

        let prev = match parent_key {
            Some(pk) => {
                let parent_entry = self.entries.get_mut(&pk).expect("parent just inserted");
                let prev = parent_entry.prev;
                parent_entry.prev = Some(key);
                prev
            }
            None => {
                let prev = self.tail;
                self.tail = Some(key);
                prev
            }
        };
        match prev {
            Some(pv) => {
                self.entries.get_mut(&pv).expect("chain member").next = Some(key);
            }
            None => self.head = Some(key),
        }

        self.entries.insert(
            key,
            SandboxEntry {
                obj: obj.clone(),
                slot: LocalSlot::Automatic,
                prev,
                next: parent_key,
            },
        );
        key
    }

    /// Sets the speculative value for `obj` (`None` marks a removal) and
    /// returns the slot it replaced.
    pub fn set_local_value(
        &mut self,
        obj: &Arc<dyn Participant>,
        value: Option<LocalValue>,
    ) -> LocalSlot {
        let key = self.insert(obj);
        let entry = self.entries.get_mut(&key).expect("entry just inserted");
        let slot = match value {
            Some(v) => LocalSlot::Value(v),
            None => LocalSlot::Removed,
        };
        std::mem::replace(&mut entry.slot, slot)
    }

    /// The slot currently held for `obj`, if any.
    pub fn slot(&self, key: ObjKey) -> Option<&LocalSlot> {
        self.entries.get(&key).map(|e| &e.slot)
    }

    /// Mutable downcast access to a staged value.
    pub fn value_mut<T: 'static>(&mut self, key: ObjKey) -> Option<&mut T> {
        match self.entries.get_mut(&key) {
            Some(SandboxEntry {
                slot: LocalSlot::Value(v),
                ..
            }) => v.downcast_mut::<T>(),
            _ => None,
        }
    }

    /// Shared downcast access to a staged value.
    pub fn value_ref<T: 'static>(&self, key: ObjKey) -> Option<&T> {
        match self.entries.get(&key) {
            Some(SandboxEntry {
                slot: LocalSlot::Value(v),
                ..
            }) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Commits the buffered writes. Returns the new epoch, or `None` when
    /// the transaction lost the race; either way the sandbox is empty
    /// afterwards.
    pub fn commit(&mut self, engine: &Engine, old_epoch: Epoch) -> Option<Epoch> {
        if self.is_empty() {
            // Nothing staged; a read-only transaction does not move the
            // clock.
            return Some(engine.current_epoch());
        }

        // Pre-flight outside the commit lock. A conflict seen here cannot
        // un-happen, so the transaction aborts without serializing.
        let guess = engine.current_epoch() + 1;
        let mut cur = self.head;
        while let Some(key) = cur {
            let entry = &self.entries[&key];
            if !entry.slot.is_automatic()
                && !entry.obj.check(old_epoch, guess, entry.slot.staged())
            {
                debug!(old_epoch, "commit pre-flight found a conflict");
                self.clear();
                return None;
            }
            cur = entry.next;
        }

        let guard = engine.commit_lock();
        let new_epoch = engine.current_epoch() + 1;

        let mut tokens: Vec<Token> = Vec::with_capacity(self.entries.len());
        let mut failed = None;
        let mut cur = self.head;
        while let Some(key) = cur {
            let entry = &self.entries[&key];
            if !entry.slot.is_automatic() {
                match entry.obj.setup(old_epoch, new_epoch, entry.slot.staged()) {
                    Some(token) => tokens.push(token),
                    None => {
                        failed = Some(key);
                        break;
                    }
                }
            }
            cur = entry.next;
        }

        let committed = failed.is_none();
        if committed {
            // Publish the epoch before finalizing anything: a transaction
            // beginning now must already observe the staged tables, and
            // must never race the cleanups the commit walk registers.
            engine.set_current_epoch(new_epoch);
            fence(Ordering::SeqCst);

            let mut tokens = tokens.into_iter();
            let mut cur = self.head;
            while let Some(key) = cur {
                let entry = &self.entries[&key];
                if !entry.slot.is_automatic() {
                    let token = tokens.next().expect("one token per staged object");
                    entry.obj.clone().commit(new_epoch, token);
                }
                cur = entry.next;
            }
        } else {
            // Undo the objects that had already staged, in chain order,
            // stopping before the one that failed.
            let mut tokens = tokens.into_iter();
            let mut cur = self.head;
            while let Some(key) = cur {
                if Some(key) == failed {
                    break;
                }
                let entry = &self.entries[&key];
                if !entry.slot.is_automatic() {
                    let token = tokens.next().expect("one token per staged object");
                    entry.obj.rollback(new_epoch, entry.slot.staged(), token);
                }
                cur = entry.next;
            }
        }

        drop(guard);
        self.clear();
        if committed {
            Some(new_epoch)
        } else {
            None
        }
    }

    /// Destroys every speculative value in chain order (descendants before
    /// ancestors) and empties the sandbox.
    pub fn clear(&mut self) {
        let mut cur = self.head;
        while let Some(key) = cur {
            let entry = self.entries.remove(&key).expect("chain member");
            if let LocalSlot::Value(value) = entry.slot {
                entry.obj.destroy_local_value(value);
            }
            cur = entry.next;
        }
        debug_assert!(self.entries.is_empty(), "sandbox chain was disconnected");
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.clear();
    }
}
