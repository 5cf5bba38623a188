//! Commit protocol behavior on in-memory versioned objects: winners,
//! losers, epoch movement, and allocation hygiene.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use umbral::{Engine, Versioned};

#[test]
fn single_writer_increment() {
    let engine = Engine::new();
    let obj = Versioned::new(&engine, 0i32);

    let mut t1 = engine.begin();
    let mut t2 = engine.begin();
    *obj.mutate(&mut t1).unwrap() = 1;
    *obj.mutate(&mut t2).unwrap() = 1;

    assert!(t1.commit());
    assert!(!t2.commit());

    let t3 = engine.begin();
    assert_eq!(obj.read(&t3).unwrap(), 1);
}

#[test]
fn failed_commit_does_not_advance_epoch() {
    let engine = Engine::new();
    let obj = Versioned::new(&engine, 0i32);
    let before = engine.current_epoch();

    let mut t1 = engine.begin();
    let mut t2 = engine.begin();
    *obj.mutate(&mut t1).unwrap() += 1;
    *obj.mutate(&mut t2).unwrap() += 1;
    assert!(t1.commit());
    assert_eq!(engine.current_epoch(), before + 1);
    assert!(!t2.commit());
    assert_eq!(engine.current_epoch(), before + 1);
}

#[test]
fn committed_epochs_are_strictly_increasing() {
    let engine = Engine::new();
    let obj = Versioned::new(&engine, 0u64);
    let mut last = engine.current_epoch();
    for i in 1..=20 {
        let mut tx = engine.begin();
        obj.write(&mut tx, i).unwrap();
        assert!(tx.commit());
        let now = engine.current_epoch();
        assert!(now > last, "epoch moved from {last} to {now}");
        last = now;
    }
}

#[test]
fn exactly_one_winner_under_contention() {
    const THREADS: usize = 8;

    let engine = Engine::new();
    let obj = Versioned::new(&engine, 0usize);
    let barrier = Arc::new(Barrier::new(THREADS));
    let wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = engine.clone();
            let obj = obj.clone();
            let barrier = barrier.clone();
            let wins = wins.clone();
            thread::spawn(move || {
                // Everyone reads the same snapshot before anyone commits.
                let mut tx = engine.begin();
                let seen = obj.read(&tx).unwrap();
                *obj.mutate(&mut tx).unwrap() = seen + 1;
                barrier.wait();
                if tx.commit() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    let tx = engine.begin();
    assert_eq!(obj.read(&tx).unwrap(), 1);
}

static LIVE: AtomicUsize = AtomicUsize::new(0);

struct Counted(i64);

impl Counted {
    fn new(value: i64) -> Self {
        LIVE.fetch_add(1, Ordering::SeqCst);
        Counted(value)
    }
}

impl Clone for Counted {
    fn clone(&self) -> Self {
        Counted::new(self.0)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn no_instances_leak_across_commits_and_aborts() {
    let baseline = LIVE.load(Ordering::SeqCst);
    {
        let engine = Engine::new();
        let obj = Versioned::new(&engine, Counted::new(0));

        for i in 1..=5 {
            let mut tx = engine.begin();
            obj.mutate(&mut tx).unwrap().0 = i;
            assert!(tx.commit());
        }

        // A conflicting pair: the loser's speculative copies must die too.
        let mut winner = engine.begin();
        let mut loser = engine.begin();
        obj.mutate(&mut winner).unwrap().0 = 100;
        obj.mutate(&mut loser).unwrap().0 = 200;
        assert!(winner.commit());
        assert!(!loser.commit());

        // An abandoned transaction rolls back by being dropped.
        let mut abandoned = engine.begin();
        obj.mutate(&mut abandoned).unwrap().0 = 300;
        drop(abandoned);

        assert_eq!(engine.live_snapshots(), 0);
    }
    assert_eq!(LIVE.load(Ordering::SeqCst), baseline);
}
