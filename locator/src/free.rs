//! Catalog of reusable node slots inside a shard blob.
//!
//! Freed slots are kept in a length-keyed map. An allocation takes the smallest slot that
//! fits, unless the best fit is more than 25% larger than requested, in which case a fresh
//! slot is appended at the end of the blob instead (reusing it would strand the excess
//! forever). Freeing the slot at the blob tail shrinks the blob rather than listing it.
//!
//! # Format
//!
//! The catalog is persisted at the tail of the shard blob on graceful shutdown:
//!
//! ```text
//! +------------+----------------------------------------------------------+
//! | Count(u32) | Count x Group                                            |
//! +------------+----------+------------+----------------------------------+
//!              | Len(u32) | Count(u32) | Count x (Offset(u64), Len(u16))  |
//!              +----------+------------+----------------------------------+
//! ```
//!
//! The group length is written as 4 bytes even though slot lengths are 2 bytes
//! everywhere else; existing files depend on it.

use crate::{node::IndexSpace, Error};
use bytes::{Buf, BufMut};
use commonware_codec::Error as CodecError;
use std::collections::BTreeMap;

/// Outcome of returning a slot to the catalog.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Freed {
    /// The slot was listed for reuse.
    Listed,
    /// The slot was at the blob tail; the blob should be truncated to the new size.
    Tail(u64),
}

/// Length-keyed catalog of free slots.
#[derive(Debug, Default)]
pub struct Catalog {
    blocks: BTreeMap<u16, Vec<IndexSpace>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all listed slots.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Number of distinct slot lengths listed.
    pub fn groups(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes listed for reuse.
    pub fn free_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .map(|(length, list)| *length as u64 * list.len() as u64)
            .sum()
    }

    /// Take a slot of at least `length` bytes, appending at `file_size` when no
    /// listed slot fits well enough.
    pub(crate) fn allocate(&mut self, length: u16, file_size: &mut u64) -> IndexSpace {
        let reuse = self.blocks.range(length..).next().map(|(len, _)| *len);
        if let Some(found) = reuse {
            // Only reuse a slot at most 25% larger than requested
            if found <= length + (length >> 2) {
                let list = self.blocks.get_mut(&found).expect("listed length");
                let space = list.pop().expect("non-empty list");
                if list.is_empty() {
                    self.blocks.remove(&found);
                }
                return space;
            }
        }
        let offset = *file_size;
        *file_size += length as u64;
        IndexSpace { offset, length }
    }

    /// Return a slot, shrinking `file_size` when the slot is at the blob tail.
    pub(crate) fn free(&mut self, space: IndexSpace, file_size: &mut u64) -> Result<Freed, Error> {
        if space.length == 0 {
            return Err(Error::IllegalState(format!(
                "free of empty slot at {}",
                space.offset
            )));
        }
        if space.offset + (space.length as u64) < *file_size {
            self.blocks.entry(space.length).or_default().push(space);
            Ok(Freed::Listed)
        } else {
            *file_size -= space.length as u64;
            Ok(Freed::Tail(*file_size))
        }
    }

    /// Bytes required by [Self::persist].
    pub(crate) fn persisted_len(&self) -> usize {
        4 + self
            .blocks
            .values()
            .map(|list| 8 + list.len() * 10)
            .sum::<usize>()
    }

    /// Serialize the catalog for the shard blob tail.
    pub(crate) fn persist(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.persisted_len());
        buf.put_u32(self.blocks.len() as u32);
        for (length, list) in &self.blocks {
            buf.put_u32(*length as u32);
            buf.put_u32(list.len() as u32);
            for space in list {
                buf.put_u64(space.offset);
                buf.put_u16(space.length);
            }
        }
        buf
    }

    /// Restore a catalog serialized by [Self::persist].
    pub(crate) fn restore(mut buf: &[u8]) -> Result<Self, Error> {
        let mut blocks = BTreeMap::new();
        if buf.remaining() < 4 {
            return Err(CodecError::EndOfBuffer.into());
        }
        let groups = buf.get_u32();
        for _ in 0..groups {
            if buf.remaining() < 8 {
                return Err(CodecError::EndOfBuffer.into());
            }
            let length = buf.get_u32();
            if length > i16::MAX as u32 {
                return Err(Error::IllegalState(format!(
                    "free slot length out of range: {length}"
                )));
            }
            let count = buf.get_u32() as usize;
            if buf.remaining() < count * 10 {
                return Err(CodecError::EndOfBuffer.into());
            }
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = buf.get_u64();
                let length = buf.get_u16();
                list.push(IndexSpace { offset, length });
            }
            // Groups persisted with no entries only add lookup cost
            if !list.is_empty() {
                blocks.insert(length as u16, list);
            }
        }
        Ok(Self { blocks })
    }
}
