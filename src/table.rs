#![allow(unsafe_code)]

//! Append-only per-object version history with lock-free readers.
//!
//! A [`VersionTable`] is immutable once published: mutation always builds
//! a new table and swaps the owning [`TableCell`]'s pointer with a single
//! compare-and-swap. Readers load the pointer with `Acquire` ordering and
//! walk the entries without locking; replaced tables are reclaimed through
//! the engine's deferred queue, which cannot fire while any snapshot that
//! could have loaded the old pointer is still live.
//!
//! Each entry is tagged with the epoch its validity ends at. The entry's
//! lower bound is the previous entry's `valid_to` (1 for the oldest); the
//! newest entry holds the current value and stays unbounded.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::error;

use crate::epoch::{Engine, Epoch, EPOCH_UNBOUNDED};

/// One version of a value with the exclusive upper bound of its validity.
#[derive(Clone, Debug)]
pub(crate) struct VersionEntry<V> {
    pub valid_to: Epoch,
    pub value: V,
}

/// Immutable-once-published history of a single object.
#[derive(Debug)]
pub(crate) struct VersionTable<V> {
    entries: Vec<VersionEntry<V>>,
}

/// Outcome of [`VersionTable::rename_epoch`].
pub(crate) enum Renamed<V> {
    /// The target was the oldest version, which stores no lower bound;
    /// nothing to rewrite.
    Unchanged(Epoch),
    /// A rewritten table and the following neighbor's lower bound.
    Swapped(VersionTable<V>, Epoch),
    /// No version is valid from the given epoch.
    NotFound,
}

impl<V: Clone> VersionTable<V> {
    /// Single-version table holding `value`, valid from the beginning of
    /// time.
    pub fn initial(value: V) -> Self {
        VersionTable {
            entries: vec![VersionEntry {
                valid_to: EPOCH_UNBOUNDED,
                value,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &VersionEntry<V> {
        &self.entries[index]
    }

    pub fn back_mut(&mut self) -> &mut VersionEntry<V> {
        self.entries.last_mut().expect("version table is never empty")
    }

    /// Copies the table, reserving room for `extra` more entries.
    pub fn copy(&self, extra: usize) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + extra);
        entries.extend(self.entries.iter().cloned());
        VersionTable { entries }
    }

    pub fn push_back(&mut self, valid_to: Epoch, value: V) {
        assert!(
            self.entries.len() < self.entries.capacity(),
            "version table overflow"
        );
        self.entries.push(VersionEntry { valid_to, value });
    }

    pub fn pop_back(&mut self) {
        assert!(self.entries.len() >= 2, "popping the last version");
        self.entries.pop();
    }

    /// Value visible to a snapshot pinned at `epoch`: the newest entry
    /// whose lower bound is at or before it.
    pub fn value_at_epoch(&self, epoch: Epoch) -> &V {
        for i in (1..self.entries.len()).rev() {
            let valid_from = self.entries[i - 1].valid_to;
            if epoch >= valid_from {
                return &self.entries[i].value;
            }
        }
        &self.entries[0].value
    }

    /// Lower bound of the current (newest) version.
    pub fn latest_valid_from(&self) -> Epoch {
        if self.entries.len() > 1 {
            self.entries[self.entries.len() - 2].valid_to
        } else {
            1
        }
    }

    /// Lower bound of the version superseded by the newest one; what a
    /// committer registers for cleanup after publishing.
    pub fn cleanup_lower_bound(&self) -> Epoch {
        if self.entries.len() > 2 {
            self.entries[self.entries.len() - 3].valid_to
        } else {
            1
        }
    }

    /// Returns a table without the version whose lower bound equals
    /// `unused_valid_from`; the neighbor's range is extended so the epoch
    /// line stays contiguous. `None` when no version matches.
    pub fn cleanup(&self, unused_valid_from: Epoch) -> Option<Self> {
        let mut out: Vec<VersionEntry<V>> = Vec::with_capacity(self.entries.len());
        let mut valid_from = 1;
        let mut found = false;
        for (i, entry) in self.entries.iter().enumerate() {
            let matches = valid_from == unused_valid_from
                || (i == 0 && unused_valid_from < self.entries[0].valid_to);
            if matches {
                assert!(!found, "two versions share valid_from {unused_valid_from}");
                found = true;
                if let Some(prev) = out.last_mut() {
                    prev.valid_to = entry.valid_to;
                }
            } else {
                out.push(entry.clone());
            }
            valid_from = entry.valid_to;
        }
        if !found {
            return None;
        }
        debug_assert_eq!(out.len() + 1, self.entries.len());
        Some(VersionTable { entries: out })
    }

    /// Relabels the version previously valid from `old_valid_from` so its
    /// validity starts at `new_valid_from` instead. Also reports the
    /// following neighbor's lower bound (0 when the neighbor is the
    /// current version or there is none).
    pub fn rename_epoch(&self, old_valid_from: Epoch, new_valid_from: Epoch) -> Renamed<V> {
        let len = self.entries.len();
        assert!(len > 0, "renaming with no versions");
        if old_valid_from < self.entries[0].valid_to {
            // The oldest version stores no lower bound; its label is
            // implicit and needs no rewrite.
            let neighbor = if len >= 2 { self.entries[0].valid_to } else { 0 };
            return Renamed::Unchanged(neighbor);
        }
        for i in 0..len {
            if self.entries[i].valid_to != old_valid_from {
                continue;
            }
            let mut next = self.copy(0);
            next.entries[i].valid_to = new_valid_from;
            let neighbor = if i + 1 < len - 1 {
                self.entries[i + 1].valid_to
            } else {
                0
            };
            return Renamed::Swapped(next, neighbor);
        }
        Renamed::NotFound
    }
}

/// Wrapper moving a retired table allocation into the deferred queue.
struct RetiredTable<V>(*mut VersionTable<V>);

// The raw pointer is the sole owner of a Box allocation; sending it to
// whichever thread drains the queue is sound as long as V itself is Send.
unsafe impl<V: Send> Send for RetiredTable<V> {}

impl<V> RetiredTable<V> {
    fn free(self) {
        // Safety: sole owner of a pointer produced by Box::into_raw.
        drop(unsafe { Box::from_raw(self.0) });
    }
}

/// Atomically replaceable pointer to a [`VersionTable`].
///
/// All reads of the current table flow through [`TableCell::load`]; all
/// mutations build a replacement and race it in with a CAS. The loser of a
/// race frees its never-published table inline; the winner retires the
/// previous table through the engine's deferred queue.
pub(crate) struct TableCell<V> {
    ptr: AtomicPtr<VersionTable<V>>,
    marker: PhantomData<VersionTable<V>>,
}

impl<V: Clone + Send + Sync + 'static> TableCell<V> {
    pub fn new(table: VersionTable<V>) -> Self {
        TableCell {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(table))),
            marker: PhantomData,
        }
    }

    /// Loads the current table without locking.
    ///
    /// The reference stays valid because replaced tables are reclaimed
    /// only through the deferred queue, which cannot fire while the
    /// calling thread holds a live snapshot (readers, committers) or the
    /// registry's dispatch pin (cleanup callbacks).
    pub fn load(&self) -> &VersionTable<V> {
        // Safety: the pointer is always a live allocation produced by this
        // cell; see the reclamation note above.
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }

    fn replace(&self, engine: &Engine, current: &VersionTable<V>, next: VersionTable<V>) -> bool {
        let next_ptr = Box::into_raw(Box::new(next));
        let current_ptr = current as *const VersionTable<V> as *mut VersionTable<V>;
        match self
            .ptr
            .compare_exchange(current_ptr, next_ptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => {
                let retired = RetiredTable(prev);
                engine.defer(Box::new(move || retired.free()));
                true
            }
            Err(_) => {
                // Lost the race; the replacement was never published.
                // Safety: next_ptr was created above and never shared.
                drop(unsafe { Box::from_raw(next_ptr) });
                false
            }
        }
    }

    /// True when some commit published a version after `old_epoch`; the
    /// conflict test shared by `check` and `setup`.
    pub fn updated_since(&self, old_epoch: Epoch) -> bool {
        self.load().latest_valid_from() > old_epoch
    }

    /// Appends `value` as the version current from `new_epoch` on,
    /// bounding the previously current version at `new_epoch`. Fails when
    /// another committer got in after `old_epoch`.
    pub fn stage(&self, engine: &Engine, old_epoch: Epoch, new_epoch: Epoch, value: V) -> bool {
        loop {
            let table = self.load();
            if table.latest_valid_from() > old_epoch {
                return false;
            }
            let mut next = table.copy(1);
            next.back_mut().valid_to = new_epoch;
            next.push_back(EPOCH_UNBOUNDED, value.clone());
            if self.replace(engine, table, next) {
                return true;
            }
        }
    }

    /// Drops the staged (newest) version again; the rollback half of
    /// [`TableCell::stage`].
    pub fn unstage(&self, engine: &Engine) {
        loop {
            let table = self.load();
            let mut next = table.copy(0);
            next.pop_back();
            next.back_mut().valid_to = EPOCH_UNBOUNDED;
            if self.replace(engine, table, next) {
                return;
            }
        }
    }

    /// Removes the version whose lower bound is `unused_valid_from`.
    /// Returns false when no version matches; the caller decides whether
    /// that is an invariant violation.
    pub fn remove_version(&self, engine: &Engine, unused_valid_from: Epoch) -> bool {
        loop {
            let table = self.load();
            if table.len() < 2 {
                error!(unused_valid_from, "cleanup with no versions to remove");
                panic!("cleanup of a single-version table");
            }
            match table.cleanup(unused_valid_from) {
                Some(next) => {
                    if self.replace(engine, table, next) {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    /// Relabels a stored lower bound, racing against concurrent swaps.
    /// `None` when no version is valid from `old_valid_from`.
    pub fn relabel(
        &self,
        engine: &Engine,
        old_valid_from: Epoch,
        new_valid_from: Epoch,
    ) -> Option<Epoch> {
        loop {
            let table = self.load();
            match table.rename_epoch(old_valid_from, new_valid_from) {
                Renamed::Unchanged(neighbor) => return Some(neighbor),
                Renamed::Swapped(next, neighbor) => {
                    if self.replace(engine, table, next) {
                        return Some(neighbor);
                    }
                }
                Renamed::NotFound => return None,
            }
        }
    }
}

impl<V> Drop for TableCell<V> {
    fn drop(&mut self) {
        // Safety: &mut self guarantees no outstanding reader references.
        drop(unsafe { Box::from_raw(*self.ptr.get_mut()) });
    }
}
