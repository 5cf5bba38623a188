//! Epoch clock, snapshot registry and deferred reclamation.
//!
//! The engine's logical clock is a single atomic epoch counter, advanced
//! only at the commit serialization point. Every transaction pins the
//! epoch it started at by registering a snapshot; the registry tracks how
//! many snapshots pin each epoch and carries the reclamation work that is
//! gated on them. Readers never touch the registry mutex.
//!
//! Reclamation comes in two flavors:
//!
//! - a superseded *version* of a participant, keyed by the epoch its
//!   validity range starts at. It runs once no live snapshot can still
//!   observe that range.
//! - an arbitrary *deferred* callback (typically freeing a replaced
//!   version table). It runs once every snapshot that was live when it was
//!   scheduled has ended.
//!
//! Both kinds migrate to earlier registry entries as later entries die, so
//! the registry mutex is only ever held for constant-time bookkeeping; the
//! callbacks themselves run after the lock is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::object::Participant;

/// A point in the engine's logical time. The current epoch is the latest
/// successfully committed version; transactions read at the epoch they
/// started at. The clock starts at 1.
pub type Epoch = u64;

/// Stored `valid_to` of the current version of every object.
pub(crate) const EPOCH_UNBOUNDED: Epoch = u64::MAX;

/// Reclamation callback scheduled through [`Engine::defer`].
pub(crate) type DeferredFn = Box<dyn FnOnce() + Send>;

enum Retired {
    Version {
        obj: Arc<dyn Participant>,
        valid_from: Epoch,
    },
    Deferred(DeferredFn),
}

#[derive(Default)]
struct EpochEntry {
    snapshots: usize,
    retired: Vec<Retired>,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<Epoch, EpochEntry>,
}

struct EngineInner {
    epoch: AtomicU64,
    registry: Mutex<Registry>,
    commit_lock: Mutex<()>,
}

/// Handle to the process-wide MVCC state: the epoch clock, the snapshot
/// registry and the commit serialization point.
///
/// Cloning an `Engine` is cheap and shares the same state; every versioned
/// object and transaction holds one, which bounds the lifetime of the
/// "global" state to the engine itself.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates a fresh engine with the clock at epoch 1 and no snapshots.
    pub fn new() -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                epoch: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
                commit_lock: Mutex::new(()),
            }),
        }
    }

    /// The latest successfully committed epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.inner.epoch.load(Ordering::Acquire)
    }

    /// Advances the clock. Only the commit walk calls this, and only while
    /// holding the commit mutex.
    pub(crate) fn set_current_epoch(&self, epoch: Epoch) {
        self.inner.epoch.store(epoch, Ordering::Release);
    }

    /// Serializes committers; held for the setup/publish/rollback span of
    /// one commit attempt.
    pub(crate) fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.commit_lock.lock()
    }

    /// Pins the current epoch for a new transaction.
    pub(crate) fn register_snapshot(&self) -> Epoch {
        let mut reg = self.inner.registry.lock();
        let epoch = self.current_epoch();
        reg.entries.entry(epoch).or_default().snapshots += 1;
        epoch
    }

    /// Releases one snapshot pinned at `epoch`. When the last pin on an
    /// epoch goes away, the retired work it gated either migrates to an
    /// earlier live epoch that still gates it or runs now.
    pub(crate) fn release_snapshot(&self, epoch: Epoch) {
        let mut runnable = Vec::new();
        let mut guard = None;
        {
            let mut reg = self.inner.registry.lock();
            let entry = match reg.entries.get_mut(&epoch) {
                Some(entry) if entry.snapshots > 0 => entry,
                _ => {
                    error!(epoch, "released a snapshot that was never registered");
                    panic!("snapshot registry underflow at epoch {epoch}");
                }
            };
            entry.snapshots -= 1;
            if entry.snapshots == 0 {
                let entry = reg.entries.remove(&epoch).expect("entry just seen");
                for retired in entry.retired {
                    migrate(&mut reg, retired, epoch, &mut runnable);
                }
            }
            if !runnable.is_empty() {
                // Pin the current epoch while the cleanups run: version
                // tables they load must not be reclaimed out from under
                // them by a concurrent committer whose snapshot ends.
                let pin = self.current_epoch();
                reg.entries.entry(pin).or_default().snapshots += 1;
                guard = Some(pin);
            }
        }
        let trigger = self.current_epoch();
        for retired in runnable {
            run_retired(retired, trigger);
        }
        if let Some(pin) = guard {
            self.release_snapshot(pin);
        }
    }

    /// Smallest epoch any live snapshot is pinned at; the cleanup horizon.
    pub fn earliest_live_epoch(&self) -> Option<Epoch> {
        let reg = self.inner.registry.lock();
        reg.entries.keys().next().copied()
    }

    /// Number of live snapshots across all epochs.
    pub fn live_snapshots(&self) -> usize {
        let reg = self.inner.registry.lock();
        reg.entries.values().map(|e| e.snapshots).sum()
    }

    /// Records that `obj` has a superseded version whose lower bound is
    /// `valid_from`. Once no live snapshot can observe that version,
    /// `obj.cleanup(valid_from, trigger)` is invoked.
    pub(crate) fn register_cleanup(&self, obj: Arc<dyn Participant>, valid_from: Epoch) {
        {
            let mut reg = self.inner.registry.lock();
            let target = reg.entries.range(valid_from..).next_back().map(|(e, _)| *e);
            if let Some(target) = target {
                reg.entries
                    .get_mut(&target)
                    .expect("target entry just seen")
                    .retired
                    .push(Retired::Version { obj, valid_from });
                return;
            }
        }
        debug!(valid_from, "superseded version has no live observers");
        obj.cleanup(valid_from, self.current_epoch());
    }

    /// Schedules `f` to run once no snapshot that was live at the time of
    /// the call remains. With no live snapshots it runs immediately.
    ///
    /// Callbacks must be side-effect-free other than freeing memory or
    /// running destructors.
    pub(crate) fn defer(&self, f: DeferredFn) {
        {
            let mut reg = self.inner.registry.lock();
            if let Some((_, entry)) = reg.entries.iter_mut().next_back() {
                entry.retired.push(Retired::Deferred(f));
                return;
            }
        }
        f();
    }
}

/// Re-attaches `retired` to the latest remaining entry that still gates
/// it, or queues it for immediate execution when none does. `died_at` is
/// the epoch of the entry that just emptied.
fn migrate(reg: &mut Registry, retired: Retired, died_at: Epoch, runnable: &mut Vec<Retired>) {
    let target = match &retired {
        // A version valid from `valid_from` is observable only by
        // snapshots pinned at or after that epoch and before the entry it
        // was originally attached to.
        Retired::Version { valid_from, .. } => reg
            .entries
            .range(*valid_from..died_at)
            .next_back()
            .map(|(e, _)| *e),
        // Deferred callbacks stay gated by any snapshot older than the
        // entry they were attached to.
        Retired::Deferred(_) => reg.entries.range(..died_at).next_back().map(|(e, _)| *e),
    };
    match target {
        Some(target) => reg
            .entries
            .get_mut(&target)
            .expect("target entry just seen")
            .retired
            .push(retired),
        None => runnable.push(retired),
    }
}

fn run_retired(retired: Retired, trigger: Epoch) {
    match retired {
        Retired::Version { obj, valid_from } => obj.cleanup(valid_from, trigger),
        Retired::Deferred(f) => f(),
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Transactions hold the engine alive, so by the time this runs the
        // registry holds at most deferred callbacks whose gating snapshots
        // leaked. Run them so their allocations are not lost.
        let reg = std::mem::take(&mut *self.registry.lock());
        for (epoch, entry) in reg.entries {
            if entry.snapshots > 0 {
                error!(epoch, "engine dropped with live snapshots");
            }
            for retired in entry.retired {
                if let Retired::Deferred(f) = retired {
                    f();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    use crate::object::Token;

    #[derive(Default)]
    struct RecordingObj {
        cleanups: Mutex<Vec<(Epoch, Epoch)>>,
    }

    impl Participant for RecordingObj {
        fn parent(&self) -> Option<Arc<dyn Participant>> {
            None
        }
        fn check(&self, _: Epoch, _: Epoch, _: Option<&(dyn Any + Send)>) -> bool {
            true
        }
        fn setup(&self, _: Epoch, _: Epoch, _: Option<&(dyn Any + Send)>) -> Option<Token> {
            Some(Token::noop())
        }
        fn commit(self: Arc<Self>, _: Epoch, _: Token) {}
        fn rollback(&self, _: Epoch, _: Option<&(dyn Any + Send)>, _: Token) {}
        fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) {
            self.cleanups.lock().push((unused_valid_from, trigger_epoch));
        }
        fn rename_epoch(&self, _: Epoch, _: Epoch) -> Epoch {
            0
        }
    }

    #[test]
    fn snapshot_pins_epoch() {
        let engine = Engine::new();
        assert_eq!(engine.earliest_live_epoch(), None);
        let e = engine.register_snapshot();
        assert_eq!(e, 1);
        assert_eq!(engine.earliest_live_epoch(), Some(1));
        assert_eq!(engine.live_snapshots(), 1);
        engine.release_snapshot(e);
        assert_eq!(engine.earliest_live_epoch(), None);
    }

    #[test]
    fn cleanup_runs_inline_without_observers() {
        let engine = Engine::new();
        let obj = Arc::new(RecordingObj::default());
        engine.register_cleanup(obj.clone(), 1);
        assert_eq!(obj.cleanups.lock().as_slice(), &[(1, 1)]);
    }

    #[test]
    fn cleanup_waits_for_gating_snapshot() {
        let engine = Engine::new();
        let obj = Arc::new(RecordingObj::default());
        let e = engine.register_snapshot();
        engine.register_cleanup(obj.clone(), 1);
        assert!(obj.cleanups.lock().is_empty());
        engine.release_snapshot(e);
        assert_eq!(obj.cleanups.lock().as_slice(), &[(1, 1)]);
    }

    #[test]
    fn cleanup_migrates_to_earlier_observer() {
        let engine = Engine::new();
        let obj = Arc::new(RecordingObj::default());
        let e1 = engine.register_snapshot();
        engine.set_current_epoch(5);
        let e5 = engine.register_snapshot();
        // Valid from epoch 1: both snapshots can observe it.
        engine.register_cleanup(obj.clone(), 1);
        engine.release_snapshot(e5);
        // The earlier snapshot still gates the version.
        assert!(obj.cleanups.lock().is_empty());
        engine.release_snapshot(e1);
        assert_eq!(obj.cleanups.lock().len(), 1);
    }

    #[test]
    fn cleanup_skips_snapshots_below_valid_from() {
        let engine = Engine::new();
        let obj = Arc::new(RecordingObj::default());
        let e1 = engine.register_snapshot();
        engine.set_current_epoch(5);
        let e5 = engine.register_snapshot();
        // Valid from epoch 3: only the snapshot at 5 can observe it.
        engine.register_cleanup(obj.clone(), 3);
        engine.release_snapshot(e5);
        assert_eq!(obj.cleanups.lock().len(), 1);
        engine.release_snapshot(e1);
        assert_eq!(obj.cleanups.lock().len(), 1);
    }

    #[test]
    fn deferred_waits_for_every_older_snapshot() {
        let engine = Engine::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let e1 = engine.register_snapshot();
        engine.set_current_epoch(3);
        let e3 = engine.register_snapshot();
        let counter = ran.clone();
        engine.defer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        engine.release_snapshot(e3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        engine.release_snapshot(e1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_runs_immediately_when_idle() {
        let engine = Engine::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        engine.defer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
