// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `.meta` and `.ram` file persistence: atomic write-then-rename, magic and
//! version gating, and startup recovery (spec §4.9, §6, §7).

use crate::coding::{decode_vlb, encode_vlb};
use crate::config::InfixBloomParams;
use crate::segment::RamSegment;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

/// `.meta`/`.ram` magic bytes, ASCII `'SPRT'` read as a big-endian `u32`
/// (spec §4.9, §6).
pub const MAGIC: u32 = 0x5452_5053;

/// Current on-disk format version this build writes.
pub const CURRENT_VERSION: u32 = 19;

/// Oldest on-disk format version this build can still read.
pub const MIN_READABLE_VERSION: u32 = 14;

fn check_header<R: Read>(reader: &mut R) -> crate::Result<u32> {
    let magic = reader.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(crate::Error::InvalidVersion(0));
    }
    let version = reader.read_u32::<BigEndian>()?;
    if version < MIN_READABLE_VERSION || version > CURRENT_VERSION {
        return Err(crate::Error::InvalidVersion(version));
    }
    Ok(version)
}

fn write_header<W: Write>(writer: &mut W) -> crate::Result<()> {
    writer.write_u32::<BigEndian>(MAGIC)?;
    writer.write_u32::<BigEndian>(CURRENT_VERSION)?;
    Ok(())
}

/// A temp file that unlinks itself unless explicitly committed, so an
/// interrupted merge/flush/persist leaves no orphaned artifact (spec §7,
/// "cancellation ... temp files unlinked via the finally-unlink flag").
pub struct TempFileGuard {
    file: tempfile::NamedTempFile,
}

impl TempFileGuard {
    /// Creates a new temp file in the same directory as `target`, so the
    /// final rename is same-filesystem and therefore atomic.
    pub fn new_in_dir_of(target: &Path) -> crate::Result<Self> {
        let folder = target.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self { file: tempfile::NamedTempFile::new_in(folder)? })
    }

    /// Writes `content` to the temp file and fsyncs it.
    pub fn write_all(&mut self, content: &[u8]) -> crate::Result<()> {
        self.file.write_all(content)?;
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        Ok(())
    }

    /// Renames the temp file into place at `target`. A failure here is
    /// fatal: the durability contract of the `.meta`/`.ram` swap requires
    /// the process to abort rather than continue with an ambiguous state
    /// (spec §7, "Persistent I/O").
    pub fn commit(self, target: &Path) -> crate::Result<()> {
        self.file.persist(target).map_err(|e| crate::Error::Fatal(format!("rename into place failed: {e}")))?;
        Ok(())
    }

    /// Explicitly discards the temp file (it would also be removed on
    /// drop, but calling this documents an intentional cancellation path).
    pub fn discard(self) {
        drop(self.file);
    }
}

/// Atomically rewrites `path` with `content` via a same-directory temp file
/// (spec §4.9: "written to `.meta.new` and renamed atomically").
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> crate::Result<()> {
    let mut guard = TempFileGuard::new_in_dir_of(path)?;
    guard.write_all(content)?;
    guard.commit(path)
}

/// Everything persisted in the `.meta` file (spec §4.9): totals, last
/// transaction id, settings needed to reconstruct the schema/tokenizer at
/// startup, and the ordered list of disk chunk ids.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaFile {
    /// Total rows ever committed across the index's lifetime.
    pub total_rows: u64,
    /// Last transaction id durably applied, for the WAL's last-saved-TID
    /// gate (spec §4.9 "Recovery via WAL").
    pub last_tid: u64,
    /// Fingerprint of the tokenizer/dictionary/schema settings in effect
    /// when this file was written; used to detect drift at startup.
    pub schema_fingerprint: u64,
    /// Word-checkpoint stride in effect.
    pub checkpoint_stride: u32,
    /// Infix bloom parameters in effect.
    pub infix_bloom: InfixBloomParams,
    /// Ordered list of disk chunk ids, oldest first.
    pub disk_chunk_ids: Vec<u64>,
    /// RAM soft limit in effect.
    pub ram_soft_limit: u64,
}

impl MetaFile {
    fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_header(&mut buf)?;
        encode_vlb(&mut buf, self.total_rows)?;
        encode_vlb(&mut buf, self.last_tid)?;
        encode_vlb(&mut buf, self.schema_fingerprint)?;
        encode_vlb(&mut buf, u64::from(self.checkpoint_stride))?;

        encode_vlb(&mut buf, u64::from(self.infix_bloom.min_infix_len))?;
        encode_vlb(&mut buf, u64::from(self.infix_bloom.max_infix_len))?;
        buf.write_u64::<BigEndian>(self.infix_bloom.false_positive_rate.to_bits())?;

        encode_vlb(&mut buf, self.disk_chunk_ids.len() as u64)?;
        for &id in &self.disk_chunk_ids {
            encode_vlb(&mut buf, id)?;
        }

        encode_vlb(&mut buf, self.ram_soft_limit)?;
        Ok(buf)
    }

    fn decode<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let _version = check_header(reader)?;

        let total_rows = decode_vlb(reader)?;
        let last_tid = decode_vlb(reader)?;
        let schema_fingerprint = decode_vlb(reader)?;
        let checkpoint_stride = decode_vlb(reader)? as u32;

        let min_infix_len = decode_vlb(reader)? as u8;
        let max_infix_len = decode_vlb(reader)? as u8;
        let false_positive_rate = f64::from_bits(reader.read_u64::<BigEndian>()?);

        let chunk_count = decode_vlb(reader)? as usize;
        let mut disk_chunk_ids = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            disk_chunk_ids.push(decode_vlb(reader)?);
        }

        let ram_soft_limit = decode_vlb(reader)?;

        Ok(Self {
            total_rows,
            last_tid,
            schema_fingerprint,
            checkpoint_stride,
            infix_bloom: InfixBloomParams { min_infix_len, max_infix_len, false_positive_rate },
            disk_chunk_ids,
            ram_soft_limit,
        })
    }

    /// Writes this meta file to `<name>.meta`, via `<name>.meta.new` and an
    /// atomic rename (spec §4.9).
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let bytes = self.encode()?;
        rewrite_atomic(path, &bytes)?;
        log::debug!("persistence: wrote meta file {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Loads a meta file, failing on magic/version mismatch with no
    /// partial-load continuation (spec §7, "Corruption at load").
    pub fn load(path: &Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut cursor = std::io::Cursor::new(bytes);
        Self::decode(&mut cursor)
    }
}

/// Writes the `.ram` file: segment count followed by each segment's
/// serialized state in the order given (spec §4.9, §6).
pub fn save_ram(path: &Path, segments: &[Arc<RamSegment>]) -> crate::Result<()> {
    let mut buf = Vec::new();
    write_header(&mut buf)?;
    encode_vlb(&mut buf, segments.len() as u64)?;
    for segment in segments {
        segment.encode_into(&mut buf)?;
    }
    rewrite_atomic(path, &buf)?;
    log::debug!("persistence: wrote ram file {} ({} segments)", path.display(), segments.len());
    Ok(())
}

/// Loads the `.ram` file, rebuilding each segment's `doc_id -> row_id` map
/// from `doc_id_word_offset` (spec §4.9 step 3).
pub fn load_ram(path: &Path, doc_id_word_offset: usize) -> crate::Result<Vec<Arc<RamSegment>>> {
    let bytes = std::fs::read(path)?;
    let mut cursor = std::io::Cursor::new(bytes);
    let _version = check_header(&mut cursor)?;

    let segment_count = decode_vlb(&mut cursor)? as usize;
    let mut segments = Vec::with_capacity(segment_count);
    for _ in 0..segment_count {
        segments.push(Arc::new(RamSegment::decode_from(&mut cursor, doc_id_word_offset)?));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_store::{BlobPool, RowStore};
    use crate::segment::{DeadRowBitmap, PostingStore};
    use rustc_hash::FxHashMap;
    use test_log::test;

    fn sample_meta() -> MetaFile {
        MetaFile {
            total_rows: 42,
            last_tid: 7,
            schema_fingerprint: 0xDEAD_BEEF,
            checkpoint_stride: 48,
            infix_bloom: InfixBloomParams::default(),
            disk_chunk_ids: vec![1, 2, 3],
            ram_soft_limit: 1024 * 1024,
        }
    }

    #[test]
    fn meta_round_trips_through_atomic_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta");

        let meta = sample_meta();
        meta.save(&path).unwrap();

        let loaded = MetaFile::load(&path).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn meta_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta");
        std::fs::write(&path, [0u8; 16]).unwrap();

        let err = MetaFile::load(&path).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidVersion(_)));
    }

    #[test]
    fn ram_round_trips_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ram");

        let mut rows = RowStore::new(2);
        rows.push_row(&[1, 0]);
        rows.push_row(&[2, 0]);
        let mut doc_id_index = FxHashMap::default();
        doc_id_index.insert(1, 0);
        doc_id_index.insert(2, 1);

        let segment = Arc::new(RamSegment::new(5, 2, rows, BlobPool::new(), PostingStore::default(), doc_id_index, DeadRowBitmap::new(2)));
        segment.kill(2);

        save_ram(&path, std::slice::from_ref(&segment)).unwrap();
        let loaded = load_ram(&path, 0).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 5);
        assert_eq!(loaded[0].u_rows(), 2);
        assert_eq!(loaded[0].alive_count(), 1);
        assert_eq!(loaded[0].find_alive_row(1), Some(0));
        assert_eq!(loaded[0].find_alive_row(2), None);
    }
}
