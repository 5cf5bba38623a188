#![allow(unsafe_code)]

//! File-backed arena: an aligned byte allocator over one memory mapping.
//!
//! The first 64 bytes of the file are the superblock. It carries the
//! format identity (checksummed on open), the `Root` slot the store's
//! directory hangs off, and the allocator state: a bump watermark plus an
//! intrusive first-fit free list threaded through the freed blocks
//! themselves. Every block is a multiple of 16 bytes, so a freed block
//! always has room for its `{len, next}` header and every offset the
//! allocator hands out is 16-byte aligned.
//!
//! All access goes through a single mutex; allocation only happens on the
//! commit path and on lazy reconstitution, neither of which is hot enough
//! to warrant anything finer.

use std::fs::OpenOptions;
use std::ops::Range;
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, UmbralError};

const MAGIC: &[u8; 8] = b"UMBRAL01";

const SB_MAGIC: Range<usize> = 0..8;
const SB_FORMAT_VERSION: Range<usize> = 8..16;
const SB_TOTAL: Range<usize> = 16..24;
const SB_CRC: Range<usize> = 24..28;
const SB_ROOT: Range<usize> = 32..40;
const SB_FREE_HEAD: Range<usize> = 40..48;
const SB_BRK: Range<usize> = 48..56;
const SB_FREE_BYTES: Range<usize> = 56..64;

/// Bytes reserved for the superblock at the start of the mapping.
const SUPERBLOCK_LEN: u64 = 64;

/// On-disk format version this build reads and writes.
const FORMAT_VERSION: u64 = 0;

/// Allocation granule and the strongest alignment the arena guarantees.
const BLOCK_ALIGN: u64 = 16;

fn round_block(bytes: u64) -> u64 {
    (bytes.max(1) + (BLOCK_ALIGN - 1)) & !(BLOCK_ALIGN - 1)
}

struct ArenaState {
    map: MmapMut,
    total: u64,
}

impl ArenaState {
    fn u64_at(&self, offset: u64) -> u64 {
        let o = offset as usize;
        u64::from_le_bytes(self.map[o..o + 8].try_into().expect("in-bounds read"))
    }

    fn set_u64_at(&mut self, offset: u64, value: u64) {
        let o = offset as usize;
        self.map[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn field(&self, range: Range<usize>) -> u64 {
        self.u64_at(range.start as u64)
    }

    fn set_field(&mut self, range: Range<usize>, value: u64) {
        self.set_u64_at(range.start as u64, value);
    }

    fn check_span(&self, offset: u64, len: u64) -> Result<()> {
        if offset < SUPERBLOCK_LEN || offset.checked_add(len).is_none() || offset + len > self.total
        {
            return Err(UmbralError::InvalidArgument(format!(
                "span [{offset}, {offset}+{len}) escapes the arena"
            )));
        }
        Ok(())
    }
}

/// Aligned byte allocator over a single memory-mapped file, plus the named
/// `Root` slot the store bootstraps from.
///
/// Offsets are stable across process restarts; pointer↔offset translation
/// is implicit in the read/write API, which never exposes raw addresses.
pub struct Arena {
    state: Mutex<ArenaState>,
}

impl Arena {
    /// Creates a new arena file of exactly `size` bytes. Fails if the file
    /// already exists.
    pub fn create(path: &Path, size: u64) -> Result<Arena> {
        if size < SUPERBLOCK_LEN + BLOCK_ALIGN {
            return Err(UmbralError::InvalidArgument(format!(
                "arena of {size} bytes cannot hold the superblock"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        // Safety: the mapping is private to this process for the lifetime
        // of the arena; all mutation goes through the state mutex.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut state = ArenaState { map, total: size };
        state.map[SB_MAGIC].copy_from_slice(MAGIC);
        state.set_field(SB_FORMAT_VERSION, FORMAT_VERSION);
        state.set_field(SB_TOTAL, size);
        let crc = crc32fast::hash(&state.map[SB_MAGIC.start..SB_TOTAL.end]);
        state.map[SB_CRC].copy_from_slice(&crc.to_le_bytes());
        state.set_field(SB_ROOT, 0);
        state.set_field(SB_FREE_HEAD, 0);
        state.set_field(SB_BRK, SUPERBLOCK_LEN);
        state.set_field(SB_FREE_BYTES, size - SUPERBLOCK_LEN);
        info!(path = %path.display(), size, "created arena");
        Ok(Arena {
            state: Mutex::new(state),
        })
    }

    /// Maps an existing arena file, validating its superblock.
    pub fn open(path: &Path) -> Result<Arena> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < SUPERBLOCK_LEN {
            return Err(UmbralError::Corruption("file too small for a superblock".into()));
        }
        // Safety: see `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let state = ArenaState { map, total: len };
        if &state.map[SB_MAGIC] != MAGIC {
            return Err(UmbralError::Corruption("bad arena magic".into()));
        }
        let version = state.field(SB_FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(UmbralError::UnsupportedVersion(version));
        }
        let stored = u32::from_le_bytes(state.map[SB_CRC].try_into().expect("fixed range"));
        let computed = crc32fast::hash(&state.map[SB_MAGIC.start..SB_TOTAL.end]);
        if stored != computed {
            return Err(UmbralError::Corruption("superblock checksum mismatch".into()));
        }
        if state.field(SB_TOTAL) != len {
            return Err(UmbralError::Corruption("arena size does not match file".into()));
        }
        info!(path = %path.display(), size = len, "opened arena");
        Ok(Arena {
            state: Mutex::new(state),
        })
    }

    /// Allocates `bytes` with the given alignment, first-fit from the free
    /// list, falling back to bumping the watermark.
    pub fn allocate_aligned(&self, bytes: u64, align: u64) -> Result<u64> {
        if align > BLOCK_ALIGN || !align.is_power_of_two() {
            return Err(UmbralError::InvalidArgument(format!(
                "unsupported alignment {align}"
            )));
        }
        let size = round_block(bytes);
        let mut state = self.state.lock();

        let mut prev: u64 = 0;
        let mut cur = state.field(SB_FREE_HEAD);
        while cur != 0 {
            let len = state.u64_at(cur);
            let next = state.u64_at(cur + 8);
            if len == size || len >= size + BLOCK_ALIGN {
                let link = if len == size {
                    next
                } else {
                    // Split; the remainder keeps the list position.
                    let rest = cur + size;
                    state.set_u64_at(rest, len - size);
                    state.set_u64_at(rest + 8, next);
                    rest
                };
                if prev == 0 {
                    state.set_field(SB_FREE_HEAD, link);
                } else {
                    state.set_u64_at(prev + 8, link);
                }
                let free = state.field(SB_FREE_BYTES);
                state.set_field(SB_FREE_BYTES, free - size);
                return Ok(cur);
            }
            prev = cur;
            cur = next;
        }

        let brk = state.field(SB_BRK);
        if brk + size > state.total {
            warn!(bytes, brk, total = state.total, "arena exhausted");
            return Err(UmbralError::OutOfSpace(format!(
                "{bytes} bytes requested, {} unmapped",
                state.total - brk
            )));
        }
        state.set_field(SB_BRK, brk + size);
        let free = state.field(SB_FREE_BYTES);
        state.set_field(SB_FREE_BYTES, free - size);
        Ok(brk)
    }

    /// Returns a block previously allocated with `bytes` to the free list.
    pub fn deallocate(&self, offset: u64, bytes: u64) -> Result<()> {
        let size = round_block(bytes);
        let mut state = self.state.lock();
        state.check_span(offset, size)?;
        if offset % BLOCK_ALIGN != 0 || offset + size > state.field(SB_BRK) {
            return Err(UmbralError::InvalidArgument(format!(
                "deallocation of [{offset}, {offset}+{size}) was never allocated"
            )));
        }
        let head = state.field(SB_FREE_HEAD);
        state.set_u64_at(offset, size);
        state.set_u64_at(offset + 8, head);
        state.set_field(SB_FREE_HEAD, offset);
        let free = state.field(SB_FREE_BYTES);
        state.set_field(SB_FREE_BYTES, free + size);
        Ok(())
    }

    /// Copies `len` bytes out of the mapping.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state.check_span(offset, len as u64)?;
        let o = offset as usize;
        Ok(state.map[o..o + len].to_vec())
    }

    /// Writes `bytes` into the mapping.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_span(offset, bytes.len() as u64)?;
        let o = offset as usize;
        state.map[o..o + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The named `Root` slot: offset of the serialized root directory.
    pub fn root_offset(&self) -> u64 {
        self.state.lock().field(SB_ROOT)
    }

    /// Atomically repoints the `Root` slot.
    pub fn set_root_offset(&self, offset: u64) {
        self.state.lock().set_field(SB_ROOT, offset);
    }

    /// Bytes available for reuse (free list plus unbumped tail).
    pub fn free_memory(&self) -> u64 {
        self.state.lock().field(SB_FREE_BYTES)
    }

    /// Flushes the mapping to its backing file.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().map.flush()?;
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(err) = self.state.lock().map.flush() {
            warn!(%err, "flush on close failed");
        }
    }
}
