//! The persistent object directory and its manager.
//!
//! The manager is itself a versioned participant: its value is the
//! directory mapping dense object ids to on-disk offsets and cached live
//! handles. Children always enter the sandbox chain before the manager, so
//! by the time the manager serializes its directory during setup, every
//! child has staged its own bytes and recorded the fresh offset here.

use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::epoch::{Engine, Epoch};
use crate::error::{Result, UmbralError};
use crate::object::{Participant, Token, TokenKind};
use crate::sandbox::{LocalSlot, ObjKey};
use crate::store::arena::Arena;
use crate::store::pvo::AnyPvo;
use crate::store::StoreInner;
use crate::table::{TableCell, VersionTable};
use crate::transaction::Transaction;

/// Dense per-manager object identifier: an index into the directory.
pub type ObjectId = u64;

/// Serialized sentinel for "no bytes on disk".
const OFFSET_NONE: u64 = u64::MAX;

/// Directory format version understood by this build.
const DIRECTORY_VERSION: u64 = 0;

/// A reconstituted or freshly constructed object cached in the directory.
pub(crate) type LiveObject = Arc<dyn AnyPvo>;

/// One directory slot: the offset of the object's serialized bytes (if it
/// has ever been committed) and the lazily attached in-memory handle. The
/// handle cell is shared between directory versions of the same lineage so
/// an attach made through an old snapshot is visible everywhere.
#[derive(Clone, Default)]
pub(crate) struct PvoEntry {
    pub offset: Option<u64>,
    pub live: Arc<OnceLock<LiveObject>>,
}

impl PvoEntry {
    pub fn with_live(live: LiveObject) -> Self {
        let entry = PvoEntry::default();
        let _ = entry.live.set(live);
        entry
    }

    pub fn vacant() -> Self {
        PvoEntry::default()
    }

    pub fn is_vacant(&self) -> bool {
        self.offset.is_none() && self.live.get().is_none()
    }
}

/// The manager's value type: the addressable-objects table at one version.
#[derive(Clone, Default)]
pub(crate) struct Directory {
    pub entries: Vec<PvoEntry>,
    pub object_count: u64,
}

impl Directory {
    /// Writes `{version, length, object_count, offsets[]}` as little-endian
    /// u64 words; deleted slots serialize as [`OFFSET_NONE`].
    pub fn serialize(&self, arena: &Arena) -> Result<u64> {
        let mut buf = Vec::with_capacity((self.entries.len() + 3) * 8);
        buf.extend_from_slice(&DIRECTORY_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.object_count.to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.offset.unwrap_or(OFFSET_NONE).to_le_bytes());
        }
        let offset = arena.allocate_aligned(buf.len() as u64, 8)?;
        arena.write(offset, &buf)?;
        Ok(offset)
    }

    pub fn reconstitute(arena: &Arena, offset: u64) -> Result<Directory> {
        let header = arena.read(offset, 24)?;
        let word = |i: usize| {
            u64::from_le_bytes(header[i * 8..(i + 1) * 8].try_into().expect("fixed range"))
        };
        let version = word(0);
        if version != DIRECTORY_VERSION {
            return Err(UmbralError::UnsupportedVersion(version));
        }
        let length = word(1);
        let object_count = word(2);
        if object_count > length {
            return Err(UmbralError::Corruption(
                "directory counts more objects than slots".into(),
            ));
        }
        let body = arena.read(offset + 24, (length * 8) as usize)?;
        let entries = body
            .chunks_exact(8)
            .map(|chunk| {
                let offset = u64::from_le_bytes(chunk.try_into().expect("chunked read"));
                PvoEntry {
                    offset: (offset != OFFSET_NONE).then_some(offset),
                    live: Arc::new(OnceLock::new()),
                }
            })
            .collect();
        Ok(Directory {
            entries,
            object_count,
        })
    }

    pub fn deallocate(arena: &Arena, offset: u64) -> Result<()> {
        let header = arena.read(offset, 16)?;
        let version = u64::from_le_bytes(header[0..8].try_into().expect("fixed range"));
        if version != DIRECTORY_VERSION {
            return Err(UmbralError::UnsupportedVersion(version));
        }
        let length = u64::from_le_bytes(header[8..16].try_into().expect("fixed range"));
        arena.deallocate(offset, (length + 3) * 8)
    }
}

/// Directory of addressable objects; the root participant of a store.
pub(crate) struct PvoManager {
    engine: Engine,
    store: Weak<StoreInner>,
    cell: TableCell<Directory>,
    /// Offsets produced by children during the current commit's setup
    /// walk, folded into the directory when the manager itself stages.
    /// Commits are serialized, so this belongs to at most one transaction.
    pending: Mutex<Vec<(ObjectId, u64)>>,
    /// The manager enrolls itself in sandboxes, which hold participants by
    /// Arc; this is the handle it enrolls.
    weak_self: Weak<PvoManager>,
}

impl PvoManager {
    pub fn new(engine: Engine, store: Weak<StoreInner>, directory: Directory) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| PvoManager {
            engine,
            store,
            cell: TableCell::new(VersionTable::initial(directory)),
            pending: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    fn key(&self) -> ObjKey {
        ObjKey::of_obj(self)
    }

    fn as_participant(&self) -> Arc<dyn Participant> {
        self.weak_self.upgrade().expect("manager is always arc-owned")
    }

    /// Marks the manager mutated in `tx`, materializing a private copy of
    /// the directory on first use. Anything that will change the directory
    /// at commit (construct, mutate, remove) goes through here first, so
    /// the manager is already in the chain when its children splice in
    /// front of it.
    pub fn ensure_local(&self, tx: &mut Transaction) -> Result<()> {
        match tx.sandbox().slot(self.key()) {
            Some(LocalSlot::Value(_)) => Ok(()),
            Some(LocalSlot::Removed) => {
                error!("the root directory cannot be removed");
                panic!("removal staged for the root directory");
            }
            _ => {
                let directory = self.cell.load().value_at_epoch(tx.epoch()).clone();
                let obj = self.as_participant();
                tx.sandbox_mut().set_local_value(&obj, Some(Box::new(directory)));
                Ok(())
            }
        }
    }

    pub fn local_dir<'t>(&self, tx: &'t Transaction) -> Option<&'t Directory> {
        tx.sandbox().value_ref::<Directory>(self.key())
    }

    pub fn local_dir_mut<'t>(&self, tx: &'t mut Transaction) -> Option<&'t mut Directory> {
        tx.sandbox_mut().value_mut::<Directory>(self.key())
    }

    /// The directory slot visible to `tx`, preferring its sandboxed copy.
    pub fn entry_at(&self, tx: &Transaction, id: ObjectId) -> Option<PvoEntry> {
        if let Some(dir) = self.local_dir(tx) {
            return dir.entries.get(id as usize).cloned();
        }
        self.cell
            .load()
            .value_at_epoch(tx.epoch())
            .entries
            .get(id as usize)
            .cloned()
    }

    /// Number of live objects visible to `tx`.
    pub fn object_count_at(&self, tx: &Transaction) -> u64 {
        if let Some(dir) = self.local_dir(tx) {
            return dir.object_count;
        }
        self.cell.load().value_at_epoch(tx.epoch()).object_count
    }

    /// Offset recorded in the committed directory at `epoch`.
    pub fn committed_offset(&self, id: ObjectId, epoch: Epoch) -> Option<u64> {
        self.cell
            .load()
            .value_at_epoch(epoch)
            .entries
            .get(id as usize)
            .and_then(|e| e.offset)
    }

    /// Swaps the persistent version recorded for `id`: the fresh offset a
    /// child's setup just serialized replaces the one the directory held
    /// at `old_epoch`, which is returned for deferred reclamation. The
    /// swap lands in the directory when the manager itself stages.
    pub fn set_persistent_version(
        &self,
        id: ObjectId,
        offset: u64,
        old_epoch: Epoch,
    ) -> Option<u64> {
        self.pending.lock().push((id, offset));
        self.committed_offset(id, old_epoch)
    }

    /// Called by a child's rollback; its staged offset must not survive
    /// into a later commit.
    pub fn unrecord_offset(&self, id: ObjectId) {
        self.pending.lock().retain(|(other, _)| *other != id);
    }

    /// Clears the slot for a removed object in `tx`'s directory copy.
    pub fn vacate(&self, tx: &mut Transaction, id: ObjectId) -> Result<()> {
        let dir = self
            .local_dir_mut(tx)
            .expect("ensure_local precedes vacate");
        let entry = dir
            .entries
            .get_mut(id as usize)
            .ok_or(UmbralError::NotFound("object"))?;
        if entry.is_vacant() {
            return Err(UmbralError::NotFound("object"));
        }
        *entry = PvoEntry::vacant();
        dir.object_count -= 1;
        Ok(())
    }
}

impl Participant for PvoManager {
    fn parent(&self) -> Option<Arc<dyn Participant>> {
        None
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
        let staged = match staged.and_then(|v| v.downcast_ref::<Directory>()) {
            Some(dir) => dir,
            None => {
                error!("manager staged something other than a directory");
                panic!("staged value has an unexpected type");
            }
        };
        let mut directory = staged.clone();
        for (id, offset) in self.pending.lock().drain(..) {
            match directory.entries.get_mut(id as usize) {
                Some(entry) => entry.offset = Some(offset),
                None => {
                    error!(id, "pending offset for an unknown directory slot");
                    panic!("pending offset for an unknown directory slot");
                }
            }
        }
        let new_offset = match directory.serialize(&store.arena) {
            Ok(offset) => offset,
            Err(err) => {
                warn!(%err, "directory serialization failed; aborting commit");
                return None;
            }
        };
        if !self
            .cell
            .stage(&self.engine, old_epoch, new_epoch, directory)
        {
            if let Err(err) = Directory::deallocate(&store.arena, new_offset) {
                warn!(%err, "could not reclaim a conflicted directory");
            }
            return None;
        }
        Some(Token(TokenKind::Directory { new_offset }))
    }

    fn commit(self: Arc<Self>, _new_epoch: Epoch, token: Token) {
        let TokenKind::Directory { new_offset } = token.0 else {
            error!("manager commit consumed a foreign token");
            panic!("unexpected token kind at commit");
        };
        let valid_from = self.cell.load().cleanup_lower_bound();
        let engine = self.engine.clone();
        let store = self.store.clone();
        engine.register_cleanup(self.clone(), valid_from);
        match self.store.upgrade() {
            Some(live) => {
                let old_root = live.arena.root_offset();
                live.arena.set_root_offset(new_offset);
                engine.defer(Box::new(move || {
                    if let Some(live) = store.upgrade() {
                        if let Err(err) = Directory::deallocate(&live.arena, old_root) {
                            warn!(%err, old_root, "deferred directory reclamation failed");
                        }
                    }
                }));
            }
            None => error!("store closed while a commit was in flight"),
        }
    }

    fn rollback(&self, _new_epoch: Epoch, _staged: Option<&(dyn Any + Send)>, token: Token) {
        let TokenKind::Directory { new_offset } = token.0 else {
            error!("manager rollback consumed a foreign token");
            panic!("unexpected token kind at rollback");
        };
        self.cell.unstage(&self.engine);
        if let Some(store) = self.store.upgrade() {
            // Never published as root; reclaim inline.
            if let Err(err) = Directory::deallocate(&store.arena, new_offset) {
                warn!(%err, "could not reclaim a rolled-back directory");
            }
        }
    }

    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) {
        if !self.cell.remove_version(&self.engine, unused_valid_from) {
            error!(
                unused_valid_from,
                trigger_epoch, "directory version to clean up does not exist"
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
