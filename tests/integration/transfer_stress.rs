//! Concurrent two-account transfers: the total is zero at every snapshot
//! no matter how the writers interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use umbral::{Engine, Versioned};

const WRITERS: usize = 4;
const TRANSFERS: usize = 400;
const ACCOUNTS: usize = 10;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn transfers_preserve_the_total() {
    init_tracing();
    let engine = Engine::new();
    let accounts: Arc<Vec<Versioned<i64>>> = Arc::new(
        (0..ACCOUNTS).map(|_| Versioned::new(&engine, 0)).collect(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let auditor = {
        let engine = engine.clone();
        let accounts = accounts.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut audits = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let tx = engine.begin();
                let total: i64 = accounts.iter().map(|a| a.read(&tx).unwrap()).sum();
                assert_eq!(total, 0, "snapshot saw a partial transfer");
                audits += 1;
            }
            audits
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|seed| {
            let engine = engine.clone();
            let accounts = accounts.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..ACCOUNTS);
                    let mut to = rng.gen_range(0..ACCOUNTS - 1);
                    if to >= from {
                        to += 1;
                    }
                    // Retry until this transfer wins its commit race.
                    loop {
                        let mut tx = engine.begin();
                        *accounts[from].mutate(&mut tx).unwrap() -= 1;
                        *accounts[to].mutate(&mut tx).unwrap() += 1;
                        if tx.commit() {
                            break;
                        }
                    }
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    let audits = auditor.join().unwrap();
    assert!(audits > 0, "the auditor never got a snapshot in");

    let tx = engine.begin();
    let total: i64 = accounts.iter().map(|a| a.read(&tx).unwrap()).sum();
    assert_eq!(total, 0);
}
