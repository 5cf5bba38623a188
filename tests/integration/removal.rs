//! Removal semantics: committed removals invalidate the id, double
//! removes and mistyped lookups are misuse.

use umbral::{Handle, Store, UmbralError};

#[test]
fn removal_invalidates_the_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.umbral");

    {
        let store = Store::create(&path, 1 << 16).expect("create");

        let mut t1 = store.begin();
        let obj = store.construct(&mut t1, 14i32).unwrap();
        assert_eq!(obj.id(), 0);
        assert!(t1.commit());

        let mut t2 = store.begin();
        let obj: Handle<i32> = store.lookup(&t2, 0).unwrap();
        obj.remove(&mut t2).unwrap();
        assert!(matches!(obj.read(&t2), Err(UmbralError::Removed)));
        assert_eq!(store.object_count(&t2), 0);
        assert!(t2.commit());

        let t3 = store.begin();
        assert!(matches!(
            store.lookup::<i32>(&t3, 0),
            Err(UmbralError::NotFound(_))
        ));
        assert_eq!(store.object_count(&t3), 0);
    }

    // The removal survives a reopen.
    let store = Store::open(&path).expect("reopen");
    let tx = store.begin();
    assert!(store.lookup::<i32>(&tx, 0).is_err());
    assert_eq!(store.object_count(&tx), 0);
}

#[test]
fn removal_rolls_back_with_the_transaction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.umbral");
    let store = Store::create(&path, 1 << 16).expect("create");

    let mut tx = store.begin();
    let obj = store.construct(&mut tx, 5i32).unwrap();
    assert!(tx.commit());

    {
        let mut tx = store.begin();
        obj.remove(&mut tx).unwrap();
        assert_eq!(store.object_count(&tx), 0);
        // Dropped without commit.
    }

    let tx = store.begin();
    assert_eq!(store.object_count(&tx), 1);
    assert_eq!(store.lookup::<i32>(&tx, obj.id()).unwrap().read(&tx).unwrap(), 5);
}

#[test]
fn double_remove_is_misuse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::create(dir.path().join("store.umbral"), 1 << 16).expect("create");

    let mut tx = store.begin();
    let obj = store.construct(&mut tx, 1i32).unwrap();
    assert!(tx.commit());

    let mut tx = store.begin();
    obj.remove(&mut tx).unwrap();
    assert!(matches!(obj.remove(&mut tx), Err(UmbralError::Removed)));
}

#[test]
fn mistyped_lookup_is_misuse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::create(dir.path().join("store.umbral"), 1 << 16).expect("create");

    let mut tx = store.begin();
    let obj = store.construct(&mut tx, 1i32).unwrap();
    assert!(tx.commit());

    let tx = store.begin();
    assert!(matches!(
        store.lookup::<i64>(&tx, obj.id()),
        Err(UmbralError::WrongType)
    ));
    assert!(matches!(
        store.lookup::<i32>(&tx, 42),
        Err(UmbralError::NotFound(_))
    ));
}
