// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Segment Merger: decides MERGE/NOMERGE/FLUSH and, on MERGE, compacts the
//! two smallest unclaimed RAM segments into one (spec §4.5).

use crate::config::{Config, MAX_PROGRESSION, MAX_SEGMENTS};
use crate::query::RtWordReader;
use crate::row_store::{pack_blob_ref, unpack_blob_ref, BlobPool, RowStore};
use crate::segment::posting::DocEntry;
use crate::segment::{DeadRowBitmap, PostingStore, PostingStoreBuilder, RamSegment, SegmentId};
use crate::ticket::OpTicket;
use crate::value::{pack_field_position, DocId, Keyword, RowId, INVALID_ROW_ID};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// The merger's policy decision for the current snapshot (spec §4.5
/// "Policy").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Fewer than `MAX_SEGMENTS - MAX_PROGRESSION` segments and the two
    /// smallest obey a geometric progression; do nothing.
    NoMerge,
    /// Merge the two smallest segments, given by index into the snapshot's
    /// RAM segment vector.
    Merge(usize, usize),
    /// RAM usage crossed the soft (or double-buffer) limit; invoke the
    /// flusher instead.
    Flush,
}

/// Computes the merger's decision for the current segment set.
///
/// `ram_used` is the index-global RAM counter; `flush_in_flight` selects
/// the tighter double-buffer limit (spec §4.5, §5 "Save-active counter").
#[must_use]
pub fn decide(segments: &[Arc<RamSegment>], ram_used: u64, config: &Config, flush_in_flight: bool) -> Decision {
    let limit = if flush_in_flight { config.double_buffer_limit() } else { config.ram_soft_limit };
    if ram_used > limit {
        return Decision::Flush;
    }

    let candidates: Vec<usize> = (0..segments.len()).filter(|&i| segments[i].op_ticket() == 0).collect();
    if candidates.len() < 2 {
        return Decision::NoMerge;
    }

    let mut by_row_count: Vec<usize> = candidates.clone();
    by_row_count.sort_by_key(|&i| segments[i].u_rows());
    let smallest = by_row_count[0];
    let second = by_row_count[1];

    if segments.len() < MAX_SEGMENTS - MAX_PROGRESSION {
        let smallest_rows = segments[smallest].u_rows().max(1);
        if segments[second].u_rows() < 2 * smallest_rows {
            return Decision::NoMerge;
        }
    }

    Decision::Merge(smallest, second)
}

fn invert_doc_id_index(segment: &RamSegment) -> FxHashMap<RowId, DocId> {
    segment.doc_id_index().iter().map(|(&doc_id, &row_id)| (row_id, doc_id)).collect()
}

/// Builds a `row_id -> new_row_id` remap for one segment's merge
/// participation: alive rows get consecutive ids starting at `base`, dead
/// rows map to [`INVALID_ROW_ID`] (spec §4.5 step 2).
fn build_remap(segment: &RamSegment, row_to_doc: &FxHashMap<RowId, DocId>, base: RowId) -> (Vec<RowId>, RowId) {
    let mut remap = vec![INVALID_ROW_ID; segment.u_rows() as usize];
    let mut next = base;
    for row_id in 0..segment.u_rows() {
        let alive = row_to_doc.get(&row_id).is_some_and(|&doc_id| segment.find_alive_row(doc_id) == Some(row_id));
        if alive {
            remap[row_id as usize] = next;
            next += 1;
        }
    }
    (remap, next)
}

fn copy_rows(
    segment: &RamSegment,
    row_to_doc: &FxHashMap<RowId, DocId>,
    remap: &[RowId],
    config: &Config,
    new_rows: &mut RowStore,
    new_blobs: &mut BlobPool,
    new_doc_id_index: &mut FxHashMap<DocId, RowId>,
) {
    for row_id in 0..segment.u_rows() {
        let new_row_id = remap[row_id as usize];
        if new_row_id == INVALID_ROW_ID {
            continue;
        }
        let mut words = segment.get_row(row_id).expect("row_id must be in range");
        if let Some(offset) = config.blob_word_offset {
            let blob_ref = unpack_blob_ref(&words, offset);
            let payload = segment.read_blob(blob_ref).to_vec();
            let new_ref = new_blobs.append(&payload);
            pack_blob_ref(&mut words, offset, new_ref);
        }
        new_rows.push_row(&words);
        if let Some(&doc_id) = row_to_doc.get(&row_id) {
            new_doc_id_index.insert(doc_id, new_row_id);
        }
    }
}

/// Remaps one keyword's decoded docs through `remap`, dropping rows that
/// died before the merge reached them.
fn remap_doc_entries(reader: &RtWordReader, docs: &[crate::segment::posting::DecodedDoc], remap: &[RowId]) -> Vec<DocEntry> {
    docs.iter()
        .filter_map(|doc| {
            let new_row_id = *remap.get(doc.row_id as usize)?;
            if new_row_id == INVALID_ROW_ID {
                return None;
            }
            let positions = reader.resolve_hits(doc);
            Some(DocEntry { row_id: new_row_id, field_mask: doc.field_mask, hits: positions.into_iter().map(|p| pack_field_position(0, p)).collect() })
        })
        .collect()
}

/// Lock-step merges two sorted keyword streams, remapping row ids and
/// dropping dead rows (spec §4.5 step 3, §4.6 step 4 "same algorithm as
/// segment merge").
fn merge_postings(a: &PostingStore, b: &PostingStore, remap_a: &[RowId], remap_b: &[RowId], config: &Config) -> crate::Result<PostingStore> {
    let mut reader_a = RtWordReader::new(a);
    let mut reader_b = RtWordReader::new(b);
    let mut next_a = reader_a.next();
    let mut next_b = reader_b.next();

    let mut builder = PostingStoreBuilder::new(config.checkpoint_stride, config.infix_bloom.min_infix_len, config.infix_bloom.false_positive_rate);

    loop {
        match (next_a.take(), next_b.take()) {
            (None, None) => break,
            (Some(a_item), None) => {
                let (keyword, docs) = a_item?;
                let entries = remap_doc_entries(&reader_a, &docs, remap_a);
                if !entries.is_empty() {
                    builder.push(&keyword, &entries)?;
                }
                next_a = reader_a.next();
            }
            (None, Some(b_item)) => {
                let (keyword, docs) = b_item?;
                let entries = remap_doc_entries(&reader_b, &docs, remap_b);
                if !entries.is_empty() {
                    builder.push(&keyword, &entries)?;
                }
                next_b = reader_b.next();
            }
            (Some(a_item), Some(b_item)) => {
                let (a_keyword, a_docs) = a_item?;
                let (b_keyword, b_docs) = b_item?;
                match a_keyword.cmp(&b_keyword) {
                    std::cmp::Ordering::Less => {
                        let entries = remap_doc_entries(&reader_a, &a_docs, remap_a);
                        if !entries.is_empty() {
                            builder.push(&a_keyword, &entries)?;
                        }
                        next_a = reader_a.next();
                        next_b = Some(Ok((b_keyword, b_docs)));
                    }
                    std::cmp::Ordering::Greater => {
                        let entries = remap_doc_entries(&reader_b, &b_docs, remap_b);
                        if !entries.is_empty() {
                            builder.push(&b_keyword, &entries)?;
                        }
                        next_b = reader_b.next();
                        next_a = Some(Ok((a_keyword, a_docs)));
                    }
                    std::cmp::Ordering::Equal => {
                        let mut entries = remap_doc_entries(&reader_a, &a_docs, remap_a);
                        entries.extend(remap_doc_entries(&reader_b, &b_docs, remap_b));
                        entries.sort_by_key(|e| e.row_id);
                        if !entries.is_empty() {
                            builder.push(&a_keyword, &entries)?;
                        }
                        next_a = reader_a.next();
                        next_b = reader_b.next();
                    }
                }
            }
        }
    }

    Ok(builder.finish())
}

/// Merges `a` and `b` into one new segment (spec §4.5 steps 2-3). The
/// caller is responsible for steps 1 (tagging), 4-6 (applying collected
/// kills/updates and publishing) and 7 (tail-recursing).
pub fn merge_segments(a: &RamSegment, b: &RamSegment, new_segment_id: SegmentId, _ticket: OpTicket, config: &Config) -> crate::Result<RamSegment> {
    let row_to_doc_a = invert_doc_id_index(a);
    let row_to_doc_b = invert_doc_id_index(b);
    let (remap_a, after_a) = build_remap(a, &row_to_doc_a, 0);
    let (remap_b, after_b) = build_remap(b, &row_to_doc_b, after_a);

    let stride = a.get_row(0).map_or(0, |row| row.len()).max(config.blob_word_offset.map_or(0, |o| o + 3));
    let mut new_rows = RowStore::new(stride);
    let mut new_blobs = BlobPool::new();
    let mut new_doc_id_index = FxHashMap::default();

    copy_rows(a, &row_to_doc_a, &remap_a, config, &mut new_rows, &mut new_blobs, &mut new_doc_id_index);
    copy_rows(b, &row_to_doc_b, &remap_b, config, &mut new_rows, &mut new_blobs, &mut new_doc_id_index);

    let postings = merge_postings(&a.postings, &b.postings, &remap_a, &remap_b, config)?;

    let u_rows = after_b;
    log::debug!("merger: merged segments into {new_segment_id} with {u_rows} rows ({} + {} sources)", a.u_rows(), b.u_rows());

    Ok(RamSegment::new(new_segment_id, u_rows, new_rows, new_blobs, postings, new_doc_id_index, DeadRowBitmap::new(u_rows as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::value::Hit;
    use test_log::test;

    fn segment_with_docs(id: SegmentId, config: &Config, docs: &[(DocId, &str)]) -> RamSegment {
        let mut rows = RowStore::new(1);
        let mut doc_id_index = FxHashMap::default();
        let mut hits = Vec::new();
        for (row_id, (doc_id, keyword)) in docs.iter().enumerate() {
            rows.push_row(&[0]);
            doc_id_index.insert(*doc_id, row_id as RowId);
            hits.push(Hit { row_id: row_id as RowId, keyword: Keyword::Bytes(keyword.as_bytes().to_vec()), field_position: pack_field_position(0, 0) });
        }
        hits.sort_by(|a, b| a.keyword.cmp(&b.keyword).then(a.row_id.cmp(&b.row_id)));

        let mut builder = PostingStoreBuilder::new(config.checkpoint_stride, 0, 0.01);
        let mut i = 0;
        while i < hits.len() {
            let mut j = i + 1;
            while j < hits.len() && hits[j].keyword == hits[i].keyword {
                j += 1;
            }
            let entries: Vec<DocEntry> = hits[i..j]
                .iter()
                .map(|h| DocEntry { row_id: h.row_id, field_mask: 1, hits: vec![h.field_position] })
                .collect();
            builder.push(&hits[i].keyword, &entries).unwrap();
            i = j;
        }

        RamSegment::new(id, docs.len() as u32, rows, BlobPool::new(), builder.finish(), doc_id_index, DeadRowBitmap::new(docs.len()))
    }

    #[test]
    fn merge_combines_disjoint_keywords_and_rows() {
        let config = Config::new("/tmp/unused");
        let a = segment_with_docs(1, &config, &[(1, "apple"), (2, "cherry")]);
        let b = segment_with_docs(2, &config, &[(3, "banana")]);

        let merged = merge_segments(&a, &b, 3, 1, &config).unwrap();
        assert_eq!(merged.u_rows(), 3);
        assert_eq!(merged.alive_count(), 3);
        assert_eq!(merged.postings.keyword_count, 3);
        assert!(merged.find_alive_row(1).is_some());
        assert!(merged.find_alive_row(2).is_some());
        assert!(merged.find_alive_row(3).is_some());
    }

    #[test]
    fn merge_drops_dead_rows() {
        let config = Config::new("/tmp/unused");
        let a = segment_with_docs(1, &config, &[(1, "apple"), (2, "cherry")]);
        assert_eq!(a.kill(1), 1);
        let b = segment_with_docs(2, &config, &[(3, "banana")]);

        let merged = merge_segments(&a, &b, 3, 1, &config).unwrap();
        assert_eq!(merged.u_rows(), 2, "the killed row must not be copied");
        assert!(merged.find_alive_row(1).is_none());
        assert!(merged.find_alive_row(2).is_some());
    }

    #[test]
    fn decide_merges_once_progression_fails() {
        let config = Config::new("/tmp/unused");
        let a = Arc::new(segment_with_docs(1, &config, &[(1, "a")]));
        let b = Arc::new(segment_with_docs(2, &config, &[(2, "b"), (3, "c"), (4, "d")]));
        let segments = vec![a, b];
        // second (3 rows) >= 2 * smallest (1 row): progression fails, merge.
        assert_eq!(decide(&segments, 0, &config, false), Decision::Merge(0, 1));
    }

    #[test]
    fn decide_skips_merge_within_progression() {
        let config = Config::new("/tmp/unused");
        let a = Arc::new(segment_with_docs(1, &config, &[(1, "a")]));
        let b = Arc::new(segment_with_docs(2, &config, &[(2, "b")]));
        let segments = vec![a, b];
        assert_eq!(decide(&segments, 0, &config, false), Decision::NoMerge);
    }

    #[test]
    fn decide_flushes_over_ram_limit() {
        let config = Config::new("/tmp/unused").ram_soft_limit(10);
        let a = Arc::new(segment_with_docs(1, &config, &[(1, "a")]));
        assert_eq!(decide(&[a], 11, &config, false), Decision::Flush);
    }
}
