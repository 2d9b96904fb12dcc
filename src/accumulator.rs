// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-writer staging area: collects one transaction's rows, blobs, hits,
//! and kill list, then materializes a new [`RamSegment`] on commit (spec
//! §4.3).

use crate::config::Config;
use crate::row_store::{pack_blob_ref, BlobPool, RowStore};
use crate::segment::posting::DocEntry;
use crate::segment::{DeadRowBitmap, PostingStore, PostingStoreBuilder, RamSegment, SegmentId};
use crate::value::{unpack_field_position, DocId, Hit, RowId};
use rustc_hash::{FxHashMap, FxHashSet};

/// Resolves duplicate doc ids appearing more than once within the same
/// transaction (spec §4.3 step 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupMode {
    /// Keep the last occurrence of a doc id.
    Replace,
    /// Keep the first occurrence of a doc id.
    Insert,
}

struct PendingDoc {
    doc_id: DocId,
    words: Vec<u32>,
    blob: Vec<u8>,
    docstore_fields: Option<Vec<u8>>,
    hits: Vec<Hit>,
}

/// Per-writer transaction staging area. Not `Send`/`Sync`: the caller owns
/// one handle per open transaction (spec §9: "expose an explicit per-writer
/// handle" rather than a thread-local).
pub struct Accumulator {
    stride: usize,
    mode: DedupMode,
    /// Row-word offset where each field's accumulated end-of-field length
    /// is written, indexed by field id. Empty disables length tracking.
    field_len_offsets: Vec<usize>,
    /// Row-word offset where the row's blob pointer (3 words: offset lo,
    /// offset hi, length) is packed, if the schema carries a blob column.
    blob_word_offset: Option<usize>,
    pending: Vec<PendingDoc>,
    kill_list: Vec<DocId>,
}

impl Accumulator {
    /// Creates an empty accumulator for a schema with the given row
    /// `stride`.
    #[must_use]
    pub fn new(stride: usize, mode: DedupMode, field_len_offsets: Vec<usize>, blob_word_offset: Option<usize>) -> Self {
        Self {
            stride,
            mode,
            field_len_offsets,
            blob_word_offset,
            pending: Vec::new(),
            kill_list: Vec::new(),
        }
    }

    /// Records one document: its fixed-attribute row, a single combined
    /// blob payload, an optional docstore payload, and its pre-tokenized
    /// hit stream. Assigns and returns a transaction-local row id.
    ///
    /// End-of-field marker hits ([`Hit::is_end_of_field_marker`]) are
    /// consumed here to populate `field_len_offsets` and are not carried
    /// into the returned hit stream.
    pub fn add_document(
        &mut self,
        doc_id: DocId,
        words: &[u32],
        blob: &[u8],
        docstore_fields: Option<&[u8]>,
        hits: Vec<Hit>,
    ) -> crate::Result<RowId> {
        if words.len() != self.stride {
            return Err(crate::Error::SchemaMismatch);
        }

        let row_id = self.pending.len() as RowId;
        let mut words = words.to_vec();

        let mut field_lens: FxHashMap<u8, u32> = FxHashMap::default();
        let mut kept_hits = Vec::with_capacity(hits.len());
        for mut hit in hits {
            hit.row_id = row_id;
            if hit.is_end_of_field_marker() {
                let (field, _) = hit.field_and_position();
                *field_lens.entry(field).or_insert(0) += 1;
            } else {
                kept_hits.push(hit);
            }
        }
        for (field, len) in field_lens {
            if let Some(&offset) = self.field_len_offsets.get(field as usize) {
                words[offset] = len;
            }
        }

        log::trace!("accumulator: staged doc_id={doc_id} as row_id={row_id}");

        self.pending.push(PendingDoc {
            doc_id,
            words,
            blob: blob.to_vec(),
            docstore_fields: docstore_fields.map(<[u8]>::to_vec),
            hits: kept_hits,
        });

        Ok(row_id)
    }

    /// Appends doc ids to the transaction's kill list (spec §4.3, §4.7).
    pub fn delete_document(&mut self, ids: &[DocId]) {
        self.kill_list.extend_from_slice(ids);
    }

    /// Drains the kill list accumulated so far. The caller (serial
    /// executor) applies this to the current snapshot *before* publishing
    /// the segment returned by [`Accumulator::commit`] (spec §4.4 ordering
    /// guarantee).
    pub fn take_kill_list(&mut self) -> Vec<DocId> {
        std::mem::take(&mut self.kill_list)
    }

    /// Finalizes the transaction into a new [`RamSegment`], or `None` if
    /// nothing was staged (spec §8, "empty accumulator commit ⇒ no
    /// segment").
    pub fn commit(&mut self, segment_id: SegmentId, config: &Config, dictionary_in_use: bool) -> crate::Result<Option<RamSegment>> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(None);
        }

        let survivor_indices = self.dedup_indices(&pending);

        // old transaction-local row id -> new consecutive row id, `None`
        // for rows superseded by a later/earlier duplicate (spec §4.3 step
        // 1: "rewrite rowids consecutively; drop dead rows").
        let mut remap: Vec<Option<RowId>> = vec![None; pending.len()];
        for (new_row_id, &old_index) in survivor_indices.iter().enumerate() {
            remap[old_index] = Some(new_row_id as RowId);
        }

        let mut rows = RowStore::new(self.stride);
        let mut blobs = BlobPool::new();
        let mut doc_id_index = FxHashMap::default();
        let mut all_hits: Vec<Hit> = Vec::new();

        for &old_index in &survivor_indices {
            // Indexing is safe: `pending` is only read, never drained,
            // until this loop finishes.
            let doc = &pending[old_index];
            let new_row_id = remap[old_index].expect("survivor must have a remap entry");

            let mut words = doc.words.clone();
            if let Some(offset) = self.blob_word_offset {
                let blob_ref = blobs.append(&doc.blob);
                pack_blob_ref(&mut words, offset, blob_ref);
            }
            rows.push_row(&words);
            doc_id_index.insert(doc.doc_id, new_row_id);

            for hit in &doc.hits {
                let mut hit = hit.clone();
                hit.row_id = new_row_id;
                all_hits.push(hit);
            }
        }

        // spec §4.3 step 2: sort by (word-or-wordid, rowid, position).
        all_hits.sort_by(|a, b| {
            a.keyword
                .cmp(&b.keyword)
                .then(a.row_id.cmp(&b.row_id))
                .then(unpack_field_position(a.field_position).1.cmp(&unpack_field_position(b.field_position).1))
        });

        let postings = Self::build_postings(&all_hits, config, dictionary_in_use)?;

        let u_rows = survivor_indices.len() as u32;
        let segment = RamSegment::new(
            segment_id,
            u_rows,
            rows,
            blobs,
            postings,
            doc_id_index,
            DeadRowBitmap::new(u_rows as usize),
        );

        log::debug!("accumulator: committed segment {segment_id} with {u_rows} rows");

        Ok(Some(segment))
    }

    /// Discards all staged state without producing a segment (spec §4.3
    /// `rollback`).
    pub fn rollback(&mut self) {
        self.pending.clear();
        self.kill_list.clear();
    }

    /// Returns, in ascending original-index order, the indices of `pending`
    /// that survive deduplication under `self.mode`.
    fn dedup_indices(&self, pending: &[PendingDoc]) -> Vec<usize> {
        let mut kept: FxHashMap<DocId, usize> = FxHashMap::default();
        match self.mode {
            DedupMode::Replace => {
                for (i, doc) in pending.iter().enumerate() {
                    kept.insert(doc.doc_id, i);
                }
            }
            DedupMode::Insert => {
                for (i, doc) in pending.iter().enumerate() {
                    kept.entry(doc.doc_id).or_insert(i);
                }
            }
        }
        let keep_set: FxHashSet<usize> = kept.into_values().collect();
        let mut indices: Vec<usize> = keep_set.into_iter().collect();
        indices.sort_unstable();
        indices
    }

    /// Groups sorted hits by keyword and serializes posting lists + word
    /// checkpoints + infix blooms (spec §4.3 steps 3-4).
    fn build_postings(sorted_hits: &[Hit], config: &Config, dictionary_in_use: bool) -> crate::Result<PostingStore> {
        let min_infix_len = if dictionary_in_use { config.infix_bloom.min_infix_len } else { 0 };
        let mut builder = PostingStoreBuilder::new(config.checkpoint_stride, min_infix_len, config.infix_bloom.false_positive_rate);

        let mut i = 0;
        while i < sorted_hits.len() {
            let mut j = i + 1;
            while j < sorted_hits.len() && sorted_hits[j].keyword == sorted_hits[i].keyword {
                j += 1;
            }
            let group = &sorted_hits[i..j];
            let entries = Self::group_into_doc_entries(group)?;
            builder.push(&sorted_hits[i].keyword, &entries)?;
            i = j;
        }

        Ok(builder.finish())
    }

    /// Groups one keyword's hits (already sorted by `(rowid, position)`)
    /// into per-document [`DocEntry`] records.
    fn group_into_doc_entries(hits: &[Hit]) -> crate::Result<Vec<DocEntry>> {
        let mut entries: Vec<DocEntry> = Vec::new();
        for hit in hits {
            let (field, _) = hit.field_and_position();
            if field >= 64 {
                return Err(crate::Error::FieldIndexOutOfRange(field));
            }
            let bit = 1u64 << field;
            match entries.last_mut() {
                Some(last) if last.row_id == hit.row_id => {
                    last.field_mask |= bit;
                    last.hits.push(hit.field_position);
                }
                _ => entries.push(DocEntry { row_id: hit.row_id, field_mask: bit, hits: vec![hit.field_position] }),
            }
        }
        Ok(entries)
    }
}
