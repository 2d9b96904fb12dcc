// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The RAM segment: an immutable-once-published shard of posting lists,
//! row store, blob pool, and dead-row bitmap (spec §3, §4.2).

pub mod bit_array;
pub mod bloom;
pub mod posting;

use crate::coding::{decode_vlb, encode_vlb};
use crate::row_store::{BlobPool, RowStore};
use crate::ticket::OpTicket;
use crate::value::{DocId, Keyword, RowId, INVALID_ROW_ID};
use bloom::InfixBloomTable;
use posting::{DocEntry, WordCheckpoint};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A monotonically increasing segment id, assigned when a segment is
/// created by the accumulator or the merger.
pub type SegmentId = u64;

/// A lock-free bitmap with one bit per row id, `true` meaning dead.
#[derive(Debug, Default)]
pub struct DeadRowBitmap {
    words: Vec<AtomicU32>,
}

impl DeadRowBitmap {
    /// Allocates a bitmap sized for `row_count` rows, all initially alive.
    #[must_use]
    pub fn new(row_count: usize) -> Self {
        let word_count = row_count.div_ceil(32);
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, AtomicU32::default);
        Self { words }
    }

    /// Marks `row_id` dead. Returns `true` if this call actually flipped
    /// the bit (idempotent: a second kill of the same row returns `false`).
    pub fn kill(&self, row_id: RowId) -> bool {
        let word_idx = row_id as usize / 32;
        let bit = 1u32 << (row_id % 32);
        let Some(word) = self.words.get(word_idx) else { return false };
        let previous = word.fetch_or(bit, Ordering::AcqRel);
        previous & bit == 0
    }

    /// Returns `true` if `row_id` is marked dead.
    #[must_use]
    pub fn is_dead(&self, row_id: RowId) -> bool {
        let word_idx = row_id as usize / 32;
        let bit = 1u32 << (row_id % 32);
        self.words
            .get(word_idx)
            .is_some_and(|w| w.load(Ordering::Acquire) & bit != 0)
    }

    /// Number of set bits (dead rows).
    #[must_use]
    pub fn popcount(&self) -> u32 {
        self.words.iter().map(|w| w.load(Ordering::Acquire).count_ones()).sum()
    }
}

/// A side channel invoked once per actual kill, installed by whichever
/// background op (merge or flush) is currently "owning" a segment, so that
/// kills arriving mid-op are captured for replay onto the successor
/// artifact (spec §4.5 step 1, §9 redesign note on kill hooks).
pub trait KillHook: Send + Sync {
    /// Called once per row that transitions alive -> dead.
    fn on_kill(&self, doc_id: DocId, row_id: RowId);
}

/// An attribute update recorded against a segment that was mid-merge or
/// mid-flush when the update landed, to be replayed onto the successor
/// artifact (spec §4.7 step 3).
#[derive(Clone, Debug)]
pub struct PostponedUpdate {
    /// Doc id the update applies to, so a successor artifact keyed
    /// differently (a disk chunk) can still apply it.
    pub doc_id: DocId,
    /// Row the update applied to in *this* segment.
    pub row_id: RowId,
    /// New row words (same stride as the segment's row store).
    pub new_words: Vec<u32>,
}

/// Encoded posting-list + word-stream data for one segment. Immutable once
/// built; readers walk it without any locking (spec §4.2: "posting-list
/// data is treated as immutable after publication and needs no locking").
#[derive(Clone, Debug, Default)]
pub struct PostingStore {
    /// Keyword-delta-encoded word stream, sorted ascending.
    pub word_stream: Vec<u8>,
    /// Doc stream: per-keyword self-terminating blocks, concatenated in
    /// word order.
    pub doc_stream: Vec<u8>,
    /// Hit stream: per-doc delta-encoded positions, referenced by doc
    /// records with more than one hit.
    pub hit_stream: Vec<u8>,
    /// Word checkpoints, one every `stride` keywords.
    pub checkpoints: Vec<WordCheckpoint>,
    /// Infix bloom blocks, index-aligned with `checkpoints`.
    pub infix_bloom: InfixBloomTable,
    /// Number of distinct keywords encoded.
    pub keyword_count: u32,
}

impl PostingStore {
    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        (self.word_stream.len() + self.doc_stream.len() + self.hit_stream.len()) as u64
    }

    /// Serializes the posting store for `.ram` persistence (spec §4.9).
    pub fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> crate::Result<()> {
        encode_vlb(writer, self.word_stream.len() as u64)?;
        writer.write_all(&self.word_stream)?;
        encode_vlb(writer, self.doc_stream.len() as u64)?;
        writer.write_all(&self.doc_stream)?;
        encode_vlb(writer, self.hit_stream.len() as u64)?;
        writer.write_all(&self.hit_stream)?;

        encode_vlb(writer, self.checkpoints.len() as u64)?;
        for checkpoint in &self.checkpoints {
            checkpoint.encode_into(writer)?;
        }

        self.infix_bloom.encode_into(writer)?;
        encode_vlb(writer, u64::from(self.keyword_count))?;
        Ok(())
    }

    /// Deserializes a posting store written by
    /// [`PostingStore::encode_into`].
    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> crate::Result<Self> {
        let word_stream = read_len_prefixed_bytes(reader)?;
        let doc_stream = read_len_prefixed_bytes(reader)?;
        let hit_stream = read_len_prefixed_bytes(reader)?;

        let checkpoint_count = decode_vlb(reader)? as usize;
        let mut checkpoints = Vec::with_capacity(checkpoint_count);
        for _ in 0..checkpoint_count {
            checkpoints.push(posting::WordCheckpoint::decode_from(reader)?);
        }

        let infix_bloom = InfixBloomTable::decode_from(reader)?;
        let keyword_count = decode_vlb(reader)? as u32;

        Ok(Self { word_stream, doc_stream, hit_stream, checkpoints, infix_bloom, keyword_count })
    }
}

fn read_len_prefixed_bytes<R: std::io::Read>(reader: &mut R) -> crate::Result<Vec<u8>> {
    let len = decode_vlb(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Builds a [`PostingStore`] from keyword-sorted `(Keyword, Vec<DocEntry>)`
/// groups, emitting a checkpoint every `stride` keywords (spec §4.3 step 3,
/// §4.1).
pub struct PostingStoreBuilder {
    stride: u32,
    infix_fp_rate: f64,
    min_infix_len: u8,
    word_stream: Vec<u8>,
    doc_stream: Vec<u8>,
    hit_stream: Vec<u8>,
    checkpoints: Vec<WordCheckpoint>,
    previous_keyword: Vec<u8>,
    keyword_index: u32,
    pending_checkpoint_words: Vec<Vec<u8>>,
}

impl PostingStoreBuilder {
    /// Creates a builder. `min_infix_len == 0` disables infix bloom
    /// construction entirely (spec §4.3 step 4).
    #[must_use]
    pub fn new(stride: u32, min_infix_len: u8, infix_fp_rate: f64) -> Self {
        Self {
            stride,
            infix_fp_rate,
            min_infix_len,
            word_stream: Vec::new(),
            doc_stream: Vec::new(),
            hit_stream: Vec::new(),
            checkpoints: Vec::new(),
            previous_keyword: Vec::new(),
            keyword_index: 0,
            pending_checkpoint_words: Vec::new(),
        }
    }

    /// Appends one keyword's posting list. `entries` must be sorted by
    /// ascending `row_id`; keywords must be fed in ascending byte order.
    pub fn push(&mut self, keyword: &Keyword, entries: &[DocEntry]) -> crate::Result<()> {
        let keyword_bytes = keyword.as_bytes();

        if self.keyword_index % self.stride == 0 {
            self.checkpoints.push(WordCheckpoint {
                keyword_index: self.keyword_index,
                word_stream_offset: self.word_stream.len() as u64,
                doc_stream_offset: self.doc_stream.len() as u64,
            });
        }

        crate::coding::encode_keyword_delta(&mut self.word_stream, &self.previous_keyword, keyword_bytes)?;
        posting::encode_posting_list(entries, &mut self.doc_stream, &mut self.hit_stream)?;

        if self.min_infix_len > 0 {
            self.pending_checkpoint_words.push(keyword_bytes.to_vec());
        }

        self.previous_keyword = keyword_bytes.to_vec();
        self.keyword_index += 1;

        Ok(())
    }

    /// Consumes the builder, producing the finished [`PostingStore`].
    #[must_use]
    pub fn finish(self) -> PostingStore {
        let infix_bloom = if self.min_infix_len > 0 {
            // Rebuild per-checkpoint groups from the flat word list we
            // accumulated; each checkpoint owns `stride` consecutive
            // keywords (the last one may own fewer).
            let stride = self.stride as usize;
            let groups: Vec<Vec<&[u8]>> = self
                .pending_checkpoint_words
                .chunks(stride.max(1))
                .map(|chunk| chunk.iter().map(Vec::as_slice).collect())
                .collect();
            InfixBloomTable::build(groups.into_iter(), self.infix_fp_rate)
        } else {
            InfixBloomTable::default()
        };

        PostingStore {
            word_stream: self.word_stream,
            doc_stream: self.doc_stream,
            hit_stream: self.hit_stream,
            checkpoints: self.checkpoints,
            infix_bloom,
            keyword_count: self.keyword_index,
        }
    }
}

/// An immutable-once-published shard of posting lists + row storage + dead
/// bitmap (spec §3, §4.2).
pub struct RamSegment {
    /// Segment id, unique for the lifetime of the process.
    pub id: SegmentId,

    /// Total rows ever stored in this segment (alive + dead).
    u_rows: u32,

    /// Currently alive row count; `u_rows - dead_bitmap.popcount()`.
    alive_count: AtomicU32,

    /// Dead-row bitmap (spec §3, invariant 1).
    dead_bitmap: DeadRowBitmap,

    /// `doc_id -> row_id`, built once at finalization (spec §4.2,
    /// "Build-time map").
    doc_id_index: FxHashMap<DocId, RowId>,

    /// Row store + blob pool, guarded by one read/write lock for in-place
    /// attribute updates (spec §4.2, §5).
    attrs: RwLock<(RowStore, BlobPool)>,

    /// Posting lists, word stream, checkpoints, infix bloom -- immutable,
    /// lock-free (spec §4.2).
    pub postings: PostingStore,

    /// Op ticket this segment is currently tagged with, `0` if free (spec
    /// §4.5 step 1, §5 "op-ticket counter").
    op_ticket: AtomicU64,

    /// Kill hook installed by whichever op currently owns this segment.
    kill_hook: RwLock<Option<Arc<dyn KillHook>>>,

    /// Updates postponed while this segment was tagged (spec §4.7 step 3).
    postponed_updates: RwLock<Vec<PostponedUpdate>>,

    /// Lazily recomputed RAM footprint, reflected into the index-global
    /// counter by whoever calls [`RamSegment::used_ram`] (spec §4.2).
    ram_used_cache: AtomicU64,
}

impl RamSegment {
    /// Constructs a segment from already-built parts. Used by the
    /// accumulator at commit and by the merger when publishing a merged
    /// segment.
    #[must_use]
    pub fn new(
        id: SegmentId,
        u_rows: u32,
        rows: RowStore,
        blobs: BlobPool,
        postings: PostingStore,
        doc_id_index: FxHashMap<DocId, RowId>,
        dead_bitmap: DeadRowBitmap,
    ) -> Self {
        let alive = u_rows - dead_bitmap.popcount();
        Self {
            id,
            u_rows,
            alive_count: AtomicU32::new(alive),
            dead_bitmap,
            doc_id_index,
            attrs: RwLock::new((rows, blobs)),
            postings,
            op_ticket: AtomicU64::new(0),
            kill_hook: RwLock::new(None),
            postponed_updates: RwLock::new(Vec::new()),
            ram_used_cache: AtomicU64::new(0),
        }
    }

    /// Total rows ever stored (alive + dead).
    #[must_use]
    pub fn u_rows(&self) -> u32 {
        self.u_rows
    }

    /// Currently alive row count (spec §8, invariant 1).
    #[must_use]
    pub fn alive_count(&self) -> u32 {
        self.alive_count.load(Ordering::Acquire)
    }

    /// The segment's `doc_id -> row_id` map, for callers (the merger, the
    /// flusher) that need to invert it into `row_id -> doc_id` when copying
    /// rows into a successor artifact.
    #[must_use]
    pub fn doc_id_index(&self) -> &FxHashMap<DocId, RowId> {
        &self.doc_id_index
    }

    /// `O(1)` hash lookup; `None` if the doc id is absent or killed.
    #[must_use]
    pub fn find_alive_row(&self, doc_id: DocId) -> Option<RowId> {
        let row_id = *self.doc_id_index.get(&doc_id)?;
        if self.dead_bitmap.is_dead(row_id) {
            None
        } else {
            Some(row_id)
        }
    }

    /// Marks `doc_id` dead. Returns `1` if this call actually killed it,
    /// `0` if it was already dead or absent (spec §8, kill idempotence).
    pub fn kill(&self, doc_id: DocId) -> u8 {
        let Some(&row_id) = self.doc_id_index.get(&doc_id) else { return 0 };
        if self.dead_bitmap.kill(row_id) {
            self.alive_count.fetch_sub(1, Ordering::AcqRel);
            if let Some(hook) = self.kill_hook.read().expect("lock poisoned").as_ref() {
                hook.on_kill(doc_id, row_id);
            }
            1
        } else {
            0
        }
    }

    /// Batched kill; returns how many doc ids were actually alive.
    pub fn kill_multi(&self, doc_ids: &[DocId]) -> u32 {
        doc_ids.iter().map(|&id| u32::from(self.kill(id))).sum()
    }

    /// Reads row `row_id`'s attribute words (acquires the read lock).
    #[must_use]
    pub fn get_row(&self, row_id: RowId) -> Option<Vec<u32>> {
        let guard = self.attrs.read().expect("lock poisoned");
        guard.0.get_row(row_id).map(<[u32]>::to_vec)
    }

    /// Reads a blob reference's bytes (acquires the read lock).
    #[must_use]
    pub fn read_blob(&self, blob_ref: crate::row_store::BlobRef) -> Vec<u8> {
        let guard = self.attrs.read().expect("lock poisoned");
        guard.1.read(blob_ref).to_vec()
    }

    /// Applies an in-place attribute update under the write lock. Returns
    /// `true` if the row existed.
    pub fn apply_update(&self, row_id: RowId, new_words: &[u32]) -> bool {
        let mut guard = self.attrs.write().expect("lock poisoned");
        match guard.0.get_row_mut(row_id) {
            Some(slot) => {
                slot.copy_from_slice(new_words);
                true
            }
            None => false,
        }
    }

    /// Recomputes (and caches) the segment's approximate RAM footprint.
    pub fn used_ram(&self) -> u64 {
        let guard = self.attrs.read().expect("lock poisoned");
        let total = guard.0.used_bytes() + guard.1.used_bytes() + self.postings.used_bytes();
        self.ram_used_cache.store(total, Ordering::Release);
        total
    }

    /// Current op ticket, `0` if not participating in any op.
    #[must_use]
    pub fn op_ticket(&self) -> OpTicket {
        self.op_ticket.load(Ordering::Acquire)
    }

    /// Tags this segment with `ticket`, installing `hook` to capture kills
    /// that arrive while the op runs (spec §4.5 step 1, §4.6 step 1).
    pub fn tag_for_op(&self, ticket: OpTicket, hook: Option<Arc<dyn KillHook>>) {
        self.op_ticket.store(ticket, Ordering::Release);
        *self.kill_hook.write().expect("lock poisoned") = hook;
    }

    /// Clears the op tag and kill hook once the op has terminated.
    pub fn clear_op_tag(&self) {
        self.op_ticket.store(0, Ordering::Release);
        *self.kill_hook.write().expect("lock poisoned") = None;
    }

    /// Records a postponed update for later replay onto a successor
    /// artifact (spec §4.7 step 3).
    pub fn postpone_update(&self, update: PostponedUpdate) {
        self.postponed_updates.write().expect("lock poisoned").push(update);
    }

    /// Drains all postponed updates accumulated while this segment was
    /// tagged (spec §4.5 step 5).
    #[must_use]
    pub fn drain_postponed_updates(&self) -> Vec<PostponedUpdate> {
        std::mem::take(&mut self.postponed_updates.write().expect("lock poisoned"))
    }

    /// Serializes this segment for `.ram` persistence, in the field order
    /// the spec's `.ram` layout demands: uRows, alive-rows, row store, blob
    /// pool, postings, dead-row bitmap (spec §4.9, §6).
    pub fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> crate::Result<()> {
        use crate::coding::encode_vlb;

        encode_vlb(writer, self.id)?;
        encode_vlb(writer, u64::from(self.u_rows))?;
        encode_vlb(writer, u64::from(self.alive_count()))?;

        let guard = self.attrs.read().expect("lock poisoned");
        guard.0.encode_into(writer)?;
        guard.1.encode_into(writer)?;
        drop(guard);

        self.postings.encode_into(writer)?;
        encode_dead_bitmap(&self.dead_bitmap, writer)?;
        Ok(())
    }

    /// Deserializes a segment written by [`RamSegment::encode_into`],
    /// reconstructing the `doc_id -> row_id` map from `doc_id_word_offset`
    /// (spec §4.9 step 3).
    pub fn decode_from<R: std::io::Read>(reader: &mut R, doc_id_word_offset: usize) -> crate::Result<Self> {
        use crate::coding::decode_vlb;

        let id = decode_vlb(reader)?;
        let u_rows = decode_vlb(reader)? as u32;
        let alive = decode_vlb(reader)? as u32;

        let rows = RowStore::decode_from(reader)?;
        let blobs = BlobPool::decode_from(reader)?;
        let postings = PostingStore::decode_from(reader)?;
        let dead_bitmap = decode_dead_bitmap(reader)?;

        let doc_id_index = Self::build_doc_id_index(&rows, doc_id_word_offset);

        Ok(Self {
            id,
            u_rows,
            alive_count: AtomicU32::new(alive),
            dead_bitmap,
            doc_id_index,
            attrs: RwLock::new((rows, blobs)),
            postings,
            op_ticket: AtomicU64::new(0),
            kill_hook: RwLock::new(None),
            postponed_updates: RwLock::new(Vec::new()),
            ram_used_cache: AtomicU64::new(0),
        })
    }

    /// Builds (or rebuilds) the `doc_id -> row_id` map, e.g. after
    /// deserializing a `.ram` file (spec §4.9 step 3).
    #[must_use]
    pub fn build_doc_id_index(rows: &RowStore, doc_id_word_offset: usize) -> FxHashMap<DocId, RowId> {
        let mut map = FxHashMap::default();
        for row_id in 0..rows.row_count() as RowId {
            if let Some(words) = rows.get_row(row_id) {
                if let Some(&lo) = words.get(doc_id_word_offset) {
                    if let Some(&hi) = words.get(doc_id_word_offset + 1) {
                        let doc_id = (i64::from(hi) << 32) | i64::from(lo);
                        map.insert(doc_id, row_id);
                    }
                }
            }
        }
        map
    }
}

/// Encodes a segment-local `DocId -> RowId` entry pair for `.ram`
/// serialization (row count + dead bitmap word count are written
/// separately by `persistence.rs`).
pub fn encode_dead_bitmap<W: std::io::Write>(bitmap: &DeadRowBitmap, writer: &mut W) -> crate::Result<()> {
    encode_vlb(writer, bitmap.words.len() as u64)?;
    for word in &bitmap.words {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Decodes a dead-row bitmap written by [`encode_dead_bitmap`].
pub fn decode_dead_bitmap<R: std::io::Read>(reader: &mut R) -> crate::Result<DeadRowBitmap> {
    let word_count = decode_vlb(reader)? as usize;
    let mut words = Vec::with_capacity(word_count);
    for _ in 0..word_count {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        words.push(AtomicU32::new(u32::from_le_bytes(buf)));
    }
    Ok(DeadRowBitmap { words })
}

/// Returns [`INVALID_ROW_ID`] when a source row maps to a dead row during
/// merge/flush rowid remapping (spec §4.5 step 2).
#[must_use]
pub fn remap_or_invalid(remap: &[RowId], row_id: RowId) -> RowId {
    remap.get(row_id as usize).copied().unwrap_or(INVALID_ROW_ID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn dead_bitmap_kill_is_idempotent() {
        let bitmap = DeadRowBitmap::new(10);
        assert!(bitmap.kill(3));
        assert!(!bitmap.kill(3));
        assert!(bitmap.is_dead(3));
        assert_eq!(bitmap.popcount(), 1);
    }

    #[test]
    fn segment_find_alive_row_and_kill() {
        let mut rows = RowStore::new(1);
        rows.push_row(&[0]);
        rows.push_row(&[0]);

        let mut doc_id_index = FxHashMap::default();
        doc_id_index.insert(7, 0);
        doc_id_index.insert(8, 1);

        let segment = RamSegment::new(
            1,
            2,
            rows,
            BlobPool::new(),
            PostingStore::default(),
            doc_id_index,
            DeadRowBitmap::new(2),
        );

        assert_eq!(segment.find_alive_row(7), Some(0));
        assert_eq!(segment.find_alive_row(9), None);
        assert_eq!(segment.alive_count(), 2);

        assert_eq!(segment.kill(7), 1);
        assert_eq!(segment.kill(7), 0);
        assert_eq!(segment.find_alive_row(7), None);
        assert_eq!(segment.alive_count(), 1);
    }
}
