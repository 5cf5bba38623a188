//! Round-trip persistence: committed values survive reopening the store,
//! uncommitted ones vanish, and the arena does not accrete garbage.

use umbral::{Handle, Store, UmbralError};

#[test]
fn round_trip_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.umbral");

    let (id_a, id_b) = {
        let store = Store::create(&path, 1 << 16).expect("create");
        let mut tx = store.begin();
        let a = store.construct(&mut tx, 14i32).unwrap();
        let b = store.construct(&mut tx, 31i32).unwrap();
        assert_eq!(a.read(&tx).unwrap(), 14);
        assert_eq!(b.read(&tx).unwrap(), 31);
        assert_eq!(store.object_count(&tx), 2);
        // The transaction sees its own constructs through lookup too.
        let again: Handle<i32> = store.lookup(&tx, a.id()).unwrap();
        assert_eq!(again.read(&tx).unwrap(), 14);
        let ids = (a.id(), b.id());
        assert!(tx.commit());
        ids
    };
    assert_eq!((id_a, id_b), (0, 1));

    let free_after_first = {
        let store = Store::open(&path).expect("reopen");
        let free_after_first = store.free_memory();

        let tx = store.begin();
        let a: Handle<i32> = store.lookup(&tx, id_a).unwrap();
        let b: Handle<i32> = store.lookup(&tx, id_b).unwrap();
        assert_eq!(a.read(&tx).unwrap(), 14);
        assert_eq!(b.read(&tx).unwrap(), 31);
        drop(tx);

        let mut tx = store.begin();
        a.write(&mut tx, 23).unwrap();
        b.write(&mut tx, 45).unwrap();
        assert!(tx.commit());

        let tx = store.begin();
        assert_eq!(a.read(&tx).unwrap(), 23);
        assert_eq!(b.read(&tx).unwrap(), 45);
        free_after_first
    };

    let store = Store::open(&path).expect("second reopen");
    let tx = store.begin();
    assert_eq!(
        store.lookup::<i32>(&tx, id_a).unwrap().read(&tx).unwrap(),
        23
    );
    assert_eq!(
        store.lookup::<i32>(&tx, id_b).unwrap().read(&tx).unwrap(),
        45
    );
    // Rewriting both values reused the blocks their predecessors freed.
    assert_eq!(store.free_memory(), free_after_first);
}

#[test]
fn uncommitted_constructs_vanish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.umbral");
    let store = Store::create(&path, 1 << 16).expect("create");

    {
        let mut tx = store.begin();
        let a = store.construct(&mut tx, 0i32).unwrap();
        let b = store.construct(&mut tx, 1i32).unwrap();
        assert_eq!(a.read(&tx).unwrap(), 0);
        assert_eq!(b.read(&tx).unwrap(), 1);
        assert_eq!(store.object_count(&tx), 2);
        // Dropped without commit.
    }

    let tx = store.begin();
    assert_eq!(store.object_count(&tx), 0);
    assert!(matches!(
        store.lookup::<i32>(&tx, 0),
        Err(UmbralError::NotFound(_))
    ));
}

#[test]
fn arena_exhaustion_fails_the_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.umbral");
    let store = Store::create(&path, 256).expect("create");

    let mut tx = store.begin();
    let huge = "x".repeat(4096);
    assert!(store.construct(&mut tx, huge).is_err() || !tx.commit());

    // The store stays usable after the failed commit.
    let mut tx = store.begin();
    assert_eq!(store.object_count(&tx), 0);
    let small = store.construct(&mut tx, 7i32).unwrap();
    assert!(tx.commit());
    let tx = store.begin();
    assert_eq!(small.read(&tx).unwrap(), 7);
}
