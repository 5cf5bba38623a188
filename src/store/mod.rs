//! The persistent object store: a directory of typed versioned objects
//! bound to one memory-mapped arena.

mod arena;
mod manager;
mod persist;
mod pvo;

pub use arena::Arena;
pub use manager::ObjectId;
pub use persist::Persist;
pub use pvo::Handle;

use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::epoch::Engine;
use crate::error::{Result, UmbralError};
use crate::object::Participant;
use crate::transaction::Transaction;

use manager::{Directory, PvoEntry, PvoManager};
use pvo::TypedPvo;

pub(crate) struct StoreInner {
    pub(crate) engine: Engine,
    pub(crate) arena: Arena,
    root: OnceLock<Arc<PvoManager>>,
}

impl StoreInner {
    pub(crate) fn root(&self) -> &Arc<PvoManager> {
        self.root.get().expect("root directory is set during open")
    }
}

/// A persistent object store.
///
/// Objects live behind dense ids in the store's root directory; their
/// committed values are serialized into the arena and survive reopening
/// the file. All mutation happens inside transactions begun with
/// [`Store::begin`]; commit sequences are not journaled, so durability
/// extends to clean closes only.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Creates a new store file of `size` bytes. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Store> {
        let engine = Engine::new();
        let arena = Arena::create(path.as_ref(), size)?;
        let inner = Arc::new(StoreInner {
            engine: engine.clone(),
            arena,
            root: OnceLock::new(),
        });
        let root = PvoManager::new(engine, Arc::downgrade(&inner), Directory::default());
        // Bootstrap: point the Root slot at an empty directory.
        let offset = Directory::default().serialize(&inner.arena)?;
        inner.arena.set_root_offset(offset);
        let _ = inner.root.set(root);
        Ok(Store { inner })
    }

    /// Opens an existing store file and reconstitutes its root directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let engine = Engine::new();
        let arena = Arena::open(path.as_ref())?;
        let root_offset = arena.root_offset();
        if root_offset == 0 {
            return Err(UmbralError::Corruption("root slot was never set".into()));
        }
        let inner = Arc::new(StoreInner {
            engine: engine.clone(),
            arena,
            root: OnceLock::new(),
        });
        let directory = Directory::reconstitute(&inner.arena, root_offset)?;
        let root = PvoManager::new(engine, Arc::downgrade(&inner), directory);
        let _ = inner.root.set(root);
        Ok(Store { inner })
    }

    /// Begins a transaction on the store's engine.
    pub fn begin(&self) -> Transaction {
        self.inner.engine.begin()
    }

    /// The engine backing this store; in-memory [`crate::Versioned`]
    /// objects created against it take part in the same commits.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Creates a new persistent object holding `value` and returns its
    /// handle. The object and its id become durable when `tx` commits.
    pub fn construct<T: Persist>(&self, tx: &mut Transaction, value: T) -> Result<Handle<T>> {
        let root = self.inner.root().clone();
        root.ensure_local(tx)?;
        let id = root
            .local_dir(tx)
            .expect("local directory just ensured")
            .entries
            .len() as ObjectId;
        let pvo = TypedPvo::new(
            id,
            self.inner.engine.clone(),
            Arc::downgrade(&self.inner),
            value.clone(),
        );
        {
            let dir = root
                .local_dir_mut(tx)
                .expect("local directory just ensured");
            dir.entries.push(PvoEntry::with_live(pvo.clone()));
            dir.object_count += 1;
        }
        let obj: Arc<dyn Participant> = pvo.clone();
        tx.sandbox_mut().set_local_value(&obj, Some(Box::new(value)));
        Ok(Handle::new(pvo))
    }

    /// Looks up the object stored under `id` as a `T`.
    ///
    /// Objects constructed by `tx` itself are visible before commit. The
    /// live handle is cached in the directory; the first lookup after a
    /// reopen reconstitutes it from the arena.
    pub fn lookup<T: Persist>(&self, tx: &Transaction, id: ObjectId) -> Result<Handle<T>> {
        let root = self.inner.root().clone();
        let entry = root
            .entry_at(tx, id)
            .ok_or(UmbralError::NotFound("object"))?;
        if let Some(live) = entry.live.get() {
            return Handle::downcast(live.clone());
        }
        let offset = entry.offset.ok_or(UmbralError::NotFound("object"))?;
        let value = T::reconstitute(&self.inner.arena, offset)?;
        let pvo = TypedPvo::new(
            id,
            self.inner.engine.clone(),
            Arc::downgrade(&self.inner),
            value,
        );
        // Attach once; a racing lookup's winner is reused by everyone.
        let _ = entry.live.set(pvo);
        let live = entry.live.get().expect("attached above").clone();
        Handle::downcast(live)
    }

    /// Number of live objects visible to `tx`.
    pub fn object_count(&self, tx: &Transaction) -> u64 {
        self.inner.root().object_count_at(tx)
    }

    /// Bytes available for reuse in the arena.
    pub fn free_memory(&self) -> u64 {
        self.inner.arena.free_memory()
    }

    /// Flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.arena.flush()
    }
}
