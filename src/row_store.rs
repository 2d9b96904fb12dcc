// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-stride row store and append-only blob pool (spec §3).

use crate::coding::{decode_vlb, encode_vlb};
use crate::value::RowId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A fixed-stride array of row words. Row `r` lives at `r * stride`.
/// Immutable after publication, except for in-place attribute updates
/// which overwrite words within an existing row (never change the stride).
#[derive(Clone, Debug, Default)]
pub struct RowStore {
    /// Words per row.
    stride: usize,
    /// Flat backing storage, `rows.len() == stride * row_count`.
    words: Vec<u32>,
}

impl RowStore {
    /// Creates an empty row store with the given stride (schema row size).
    #[must_use]
    pub fn new(stride: usize) -> Self {
        Self { stride, words: Vec::new() }
    }

    /// Number of rows currently stored.
    #[must_use]
    pub fn row_count(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.words.len() / self.stride
        }
    }

    /// Words per row.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Appends one row's words, returning its newly assigned row id.
    ///
    /// # Panics
    ///
    /// Panics if `words.len() != stride`.
    pub fn push_row(&mut self, words: &[u32]) -> RowId {
        assert_eq!(words.len(), self.stride, "row width must match stride");
        let row_id = self.row_count() as RowId;
        self.words.extend_from_slice(words);
        row_id
    }

    /// Returns the words for `row_id`, or `None` if out of range.
    #[must_use]
    pub fn get_row(&self, row_id: RowId) -> Option<&[u32]> {
        let start = row_id as usize * self.stride;
        self.words.get(start..start + self.stride)
    }

    /// Returns the words for `row_id` mutably, for in-place attribute
    /// updates.
    pub fn get_row_mut(&mut self, row_id: RowId) -> Option<&mut [u32]> {
        let start = row_id as usize * self.stride;
        let stride = self.stride;
        self.words.get_mut(start..start + stride)
    }

    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        (self.words.len() * std::mem::size_of::<u32>()) as u64
    }

    /// Serializes the row store for `.ram` persistence (spec §4.9).
    pub fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> crate::Result<()> {
        encode_vlb(writer, self.stride as u64)?;
        encode_vlb(writer, self.words.len() as u64)?;
        for &word in &self.words {
            writer.write_u32::<LittleEndian>(word)?;
        }
        Ok(())
    }

    /// Deserializes a row store written by [`RowStore::encode_into`].
    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> crate::Result<Self> {
        let stride = decode_vlb(reader)? as usize;
        let word_count = decode_vlb(reader)? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(reader.read_u32::<LittleEndian>()?);
        }
        Ok(Self { stride, words })
    }
}

/// Packs a [`BlobRef`] into three consecutive row words (offset low, offset
/// high, length), so a fixed-stride row can carry a pointer into the blob
/// pool without widening the row word type to 64 bits.
pub fn pack_blob_ref(words: &mut [u32], at: usize, blob_ref: BlobRef) {
    let (offset, len) = blob_ref;
    words[at] = offset as u32;
    words[at + 1] = (offset >> 32) as u32;
    words[at + 2] = len;
}

/// Inverse of [`pack_blob_ref`].
#[must_use]
pub fn unpack_blob_ref(words: &[u32], at: usize) -> BlobRef {
    let offset = u64::from(words[at]) | (u64::from(words[at + 1]) << 32);
    (offset, words[at + 2])
}

/// Append-only byte vector holding variable-length attributes, referenced
/// by per-row offsets. May be overwritten in place only when a new value is
/// the same length or shorter than what was already there; otherwise it
/// grows via append (spec §3, Blob pool).
#[derive(Clone, Debug, Default)]
pub struct BlobPool {
    bytes: Vec<u8>,
}

/// A `(offset, length)` reference into a [`BlobPool`].
pub type BlobRef = (u64, u32);

impl BlobPool {
    /// Creates an empty blob pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `payload`, returning a reference to it.
    pub fn append(&mut self, payload: &[u8]) -> BlobRef {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(payload);
        (offset, payload.len() as u32)
    }

    /// Reads the bytes at `blob_ref`.
    #[must_use]
    pub fn read(&self, blob_ref: BlobRef) -> &[u8] {
        let (offset, len) = blob_ref;
        let start = offset as usize;
        &self.bytes[start..start + len as usize]
    }

    /// Updates the payload previously stored at `existing`. If `payload`
    /// fits within the existing allocation it's overwritten in place and
    /// the same offset (with the new, possibly smaller, length) is
    /// returned; otherwise the payload is appended and a new reference is
    /// returned (spec §3: "copied/appended never mutated in place except
    /// overwrites of same-or-smaller length").
    pub fn update(&mut self, existing: BlobRef, payload: &[u8]) -> BlobRef {
        let (offset, old_len) = existing;
        if payload.len() as u32 <= old_len {
            let start = offset as usize;
            self.bytes[start..start + payload.len()].copy_from_slice(payload);
            (offset, payload.len() as u32)
        } else {
            self.append(payload)
        }
    }

    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Serializes the blob pool for `.ram` persistence (spec §4.9).
    pub fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> crate::Result<()> {
        encode_vlb(writer, self.bytes.len() as u64)?;
        writer.write_all(&self.bytes)?;
        Ok(())
    }

    /// Deserializes a blob pool written by [`BlobPool::encode_into`].
    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> crate::Result<Self> {
        let len = decode_vlb(reader)? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn row_store_push_and_get() {
        let mut store = RowStore::new(3);
        let r0 = store.push_row(&[1, 2, 3]);
        let r1 = store.push_row(&[4, 5, 6]);
        assert_eq!(r0, 0);
        assert_eq!(r1, 1);
        assert_eq!(store.get_row(0), Some([1, 2, 3].as_slice()));
        assert_eq!(store.get_row(1), Some([4, 5, 6].as_slice()));
        assert_eq!(store.get_row(2), None);
    }

    #[test]
    fn blob_pool_overwrite_shorter_in_place() {
        let mut pool = BlobPool::new();
        let r = pool.append(b"hello world");
        let r2 = pool.update(r, b"hi");
        assert_eq!(r2.0, r.0);
        assert_eq!(pool.read(r2), b"hi");
    }

    #[test]
    fn blob_pool_grow_appends() {
        let mut pool = BlobPool::new();
        let r = pool.append(b"hi");
        let r2 = pool.update(r, b"hello world");
        assert_ne!(r2.0, r.0);
        assert_eq!(pool.read(r2), b"hello world");
    }
}
