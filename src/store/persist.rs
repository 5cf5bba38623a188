//! Per-type serializer seam.
//!
//! The MVCC core never looks inside a persistent value; everything it
//! needs is the three operations below. Implementations own their layout
//! entirely, the engine only remembers the offset `serialize` returned.

use crate::error::{Result, UmbralError};
use crate::store::arena::Arena;

/// Encoding of a value type into the store's arena.
///
/// `Clone` is required because mutation materializes a private copy in the
/// transaction sandbox, and `Send + Sync + 'static` because handles and
/// version tables cross threads freely.
pub trait Persist: Clone + Send + Sync + Sized + 'static {
    /// Writes `self` into the arena, returning the offset of the bytes.
    fn serialize(&self, arena: &Arena) -> Result<u64>;

    /// Rebuilds a value from bytes previously written at `offset`.
    fn reconstitute(arena: &Arena, offset: u64) -> Result<Self>;

    /// Returns the bytes at `offset` to the arena.
    fn deallocate(arena: &Arena, offset: u64) -> Result<()>;
}

macro_rules! persist_fixed_width {
    ($($ty:ty),* $(,)?) => {$(
        impl Persist for $ty {
            fn serialize(&self, arena: &Arena) -> Result<u64> {
                let bytes = self.to_le_bytes();
                let offset = arena.allocate_aligned(
                    bytes.len() as u64,
                    std::mem::align_of::<$ty>() as u64,
                )?;
                arena.write(offset, &bytes)?;
                Ok(offset)
            }

            fn reconstitute(arena: &Arena, offset: u64) -> Result<Self> {
                let bytes = arena.read(offset, std::mem::size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(
                    bytes.as_slice().try_into().expect("fixed-width read"),
                ))
            }

            fn deallocate(arena: &Arena, offset: u64) -> Result<()> {
                arena.deallocate(offset, std::mem::size_of::<$ty>() as u64)
            }
        }
    )*};
}

persist_fixed_width!(i32, i64, u32, u64, f64);

/// Length-prefixed UTF-8: `[len: u64 le][bytes]`.
impl Persist for String {
    fn serialize(&self, arena: &Arena) -> Result<u64> {
        let mut buf = Vec::with_capacity(8 + self.len());
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
        let offset = arena.allocate_aligned(buf.len() as u64, 8)?;
        arena.write(offset, &buf)?;
        Ok(offset)
    }

    fn reconstitute(arena: &Arena, offset: u64) -> Result<Self> {
        let header = arena.read(offset, 8)?;
        let len = u64::from_le_bytes(header.as_slice().try_into().expect("fixed-width read"));
        let bytes = arena.read(offset + 8, len as usize)?;
        String::from_utf8(bytes)
            .map_err(|_| UmbralError::Corruption("string payload is not UTF-8".into()))
    }

    fn deallocate(arena: &Arena, offset: u64) -> Result<()> {
        let header = arena.read(offset, 8)?;
        let len = u64::from_le_bytes(header.as_slice().try_into().expect("fixed-width read"));
        arena.deallocate(offset, 8 + len)
    }
}

/// Length-prefixed bytes: `[len: u64 le][bytes]`.
impl Persist for Vec<u8> {
    fn serialize(&self, arena: &Arena) -> Result<u64> {
        let mut buf = Vec::with_capacity(8 + self.len());
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        buf.extend_from_slice(self);
        let offset = arena.allocate_aligned(buf.len() as u64, 8)?;
        arena.write(offset, &buf)?;
        Ok(offset)
    }

    fn reconstitute(arena: &Arena, offset: u64) -> Result<Self> {
        let header = arena.read(offset, 8)?;
        let len = u64::from_le_bytes(header.as_slice().try_into().expect("fixed-width read"));
        arena.read(offset + 8, len as usize)
    }

    fn deallocate(arena: &Arena, offset: u64) -> Result<()> {
        let header = arena.read(offset, 8)?;
        let len = u64::from_le_bytes(header.as_slice().try_into().expect("fixed-width read"));
        arena.deallocate(offset, 8 + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codecs_round_trip_and_reclaim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let arena = Arena::create(&dir.path().join("p.umbral"), 4096).expect("create");
        let baseline = arena.free_memory();

        let a = 14i32.serialize(&arena).unwrap();
        let b = "fourteen".to_string().serialize(&arena).unwrap();
        assert_eq!(i32::reconstitute(&arena, a).unwrap(), 14);
        assert_eq!(String::reconstitute(&arena, b).unwrap(), "fourteen");

        i32::deallocate(&arena, a).unwrap();
        String::deallocate(&arena, b).unwrap();
        assert_eq!(arena.free_memory(), baseline);
    }
}
