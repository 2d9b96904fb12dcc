// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-segment posting-list codec: the doc stream (rowid-delta, field
//! mask, hit count, hit ref) and the hit stream (position deltas), plus
//! word checkpoints that bound keyword lookup scans (spec §3, §4.1).

use crate::coding::{decode_inline_hit, decode_vlb, encode_inline_hit, encode_vlb, DecodeError, EncodeError};
use crate::value::{unpack_field_position, RowId};
use std::io::Write;

/// One document's posting entry for a keyword, pre-encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocEntry {
    /// Row id within the segment.
    pub row_id: RowId,
    /// Bitmask of fields in which the keyword occurs for this row. Field
    /// indices range `0..=255` (spec §3's packed field+position encoding),
    /// so this is wide enough for every bit a real schema can set.
    pub field_mask: u64,
    /// Packed (field, position) occurrences, in ascending `(field,
    /// position)` order. Length is the doc's hit count.
    pub hits: Vec<u32>,
}

/// Appends one keyword's encoded doc stream + hit stream to `doc_out` /
/// `hit_out`. `entries` must already be sorted by ascending `row_id`.
///
/// Per spec §4.1: a doc with exactly one hit stores that hit's position
/// inline in the doc record instead of allocating a hit-stream entry.
pub fn encode_posting_list<W1: Write, W2: Write>(
    entries: &[DocEntry],
    doc_out: &mut W1,
    hit_out: &mut W2,
) -> Result<(), EncodeError> {
    encode_vlb(doc_out, entries.len() as u64)?;

    let mut prev_row_id: i64 = -1;
    let mut hit_stream_base: u64 = 0;

    for entry in entries {
        let delta = entry.row_id as i64 - prev_row_id - 1;
        assert!(delta >= 0, "doc entries must be sorted by ascending row_id");
        prev_row_id = entry.row_id as i64;

        encode_vlb(doc_out, delta as u64)?;
        encode_vlb(doc_out, entry.field_mask)?;
        encode_vlb(doc_out, entry.hits.len() as u64)?;

        if entry.hits.len() == 1 {
            let (_, position) = unpack_field_position(entry.hits[0]);
            encode_inline_hit(doc_out, u64::from(position))?;
        } else {
            let hit_ref = hit_stream_base;
            encode_vlb(doc_out, hit_ref)?;

            let mut prev_position: i64 = -1;
            for &packed in &entry.hits {
                let (_, position) = unpack_field_position(packed);
                let position = i64::from(position);
                let delta = position - prev_position - 1;
                assert!(delta >= 0, "hit positions must be strictly increasing");
                prev_position = position;
                hit_stream_base += encode_vlb(hit_out, delta as u64)? as u64;
            }
        }
    }

    Ok(())
}

/// Sequential reader over a keyword's doc stream. Mirrors `RtDocReader`
/// (spec §2).
pub struct DocStreamReader<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
    remaining: u64,
    prev_row_id: i64,
}

/// One decoded doc-stream record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedDoc {
    /// Absolute row id (delta already applied).
    pub row_id: RowId,
    /// Field mask as encoded.
    pub field_mask: u64,
    /// Number of hits for this doc.
    pub hit_count: u64,
    /// `Some(position)` if `hit_count == 1` (inline); `None` if the hits
    /// must be read from the hit stream starting at `hit_ref`.
    pub inline_position: Option<u32>,
    /// Offset into the hit stream where this doc's hits start, valid only
    /// when `inline_position.is_none()`.
    pub hit_ref: u64,
}

impl<'a> DocStreamReader<'a> {
    /// Creates a reader over an encoded doc stream.
    pub fn new(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let remaining = decode_vlb(&mut cursor)?;
        Ok(Self { cursor, remaining, prev_row_id: -1 })
    }

    /// Number of doc records left to read.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Bytes consumed so far, i.e. where the next keyword's doc records
    /// begin within the segment's doc stream.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }
}

impl<'a> Iterator for DocStreamReader<'a> {
    type Item = Result<DecodedDoc, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delta = match decode_vlb(&mut self.cursor) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        self.prev_row_id += 1 + delta as i64;
        let row_id = self.prev_row_id as RowId;

        let field_mask = match decode_vlb(&mut self.cursor) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let hit_count = match decode_vlb(&mut self.cursor) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };

        if hit_count == 1 {
            let position = match decode_inline_hit(&mut self.cursor) {
                Ok(v) => v as u32,
                Err(e) => return Some(Err(e)),
            };
            Some(Ok(DecodedDoc { row_id, field_mask, hit_count, inline_position: Some(position), hit_ref: 0 }))
        } else {
            let hit_ref = match decode_vlb(&mut self.cursor) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            Some(Ok(DecodedDoc { row_id, field_mask, hit_count, inline_position: None, hit_ref }))
        }
    }
}

/// Reads `count` delta-encoded positions starting at byte offset
/// `hit_ref` in a hit stream, restarting the running base at `hit_ref`
/// (spec §4.1: "readers must reset their running base accordingly").
/// Mirrors `RtHitReader` (spec §2).
pub fn read_hits(hit_stream: &[u8], hit_ref: u64, count: u64) -> Result<Vec<u32>, DecodeError> {
    let mut cursor = std::io::Cursor::new(&hit_stream[hit_ref as usize..]);
    let mut positions = Vec::with_capacity(count as usize);
    let mut prev: i64 = -1;
    for _ in 0..count {
        let delta = decode_vlb(&mut cursor)?;
        prev += 1 + delta as i64;
        positions.push(prev as u32);
    }
    Ok(positions)
}

/// A word checkpoint: offset into the word stream plus either a word id or
/// packed word bytes, recorded every `stride` keywords.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WordCheckpoint {
    /// Index of the first keyword covered by this checkpoint.
    pub keyword_index: u32,
    /// Byte offset into the word stream where this checkpoint's keyword
    /// begins.
    pub word_stream_offset: u64,
    /// Byte offset into the doc stream where this keyword's postings
    /// begin.
    pub doc_stream_offset: u64,
}

impl WordCheckpoint {
    /// Serializes this checkpoint for `.ram` persistence (spec §4.9).
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_vlb(writer, u64::from(self.keyword_index))?;
        encode_vlb(writer, self.word_stream_offset)?;
        encode_vlb(writer, self.doc_stream_offset)?;
        Ok(())
    }

    /// Deserializes a checkpoint written by [`WordCheckpoint::encode_into`].
    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            keyword_index: decode_vlb(reader)? as u32,
            word_stream_offset: decode_vlb(reader)?,
            doc_stream_offset: decode_vlb(reader)?,
        })
    }
}

/// Verifies checkpoints are monotonic in both offset and keyword order
/// (spec §8, invariant 3).
#[must_use]
pub fn checkpoints_are_monotonic(checkpoints: &[WordCheckpoint]) -> bool {
    checkpoints.windows(2).all(|pair| {
        pair[0].keyword_index < pair[1].keyword_index
            && pair[0].word_stream_offset < pair[1].word_stream_offset
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::pack_field_position;
    use test_log::test;

    #[test]
    fn single_hit_is_inlined() {
        let entries = vec![DocEntry {
            row_id: 3,
            field_mask: 0b1,
            hits: vec![pack_field_position(0, 7)],
        }];

        let mut doc_bytes = vec![];
        let mut hit_bytes = vec![];
        encode_posting_list(&entries, &mut doc_bytes, &mut hit_bytes).unwrap();
        assert!(hit_bytes.is_empty(), "single-hit doc must not touch the hit stream");

        let mut reader = DocStreamReader::new(&doc_bytes).unwrap();
        let doc = reader.next().unwrap().unwrap();
        assert_eq!(doc.row_id, 3);
        assert_eq!(doc.hit_count, 1);
        assert_eq!(doc.inline_position, Some(7));
        assert!(reader.next().is_none());
    }

    #[test]
    fn multi_hit_round_trips_through_hit_stream() {
        let entries = vec![
            DocEntry {
                row_id: 0,
                field_mask: 0b1,
                hits: vec![pack_field_position(0, 1), pack_field_position(0, 5), pack_field_position(0, 9)],
            },
            DocEntry {
                row_id: 4,
                field_mask: 0b11,
                hits: vec![pack_field_position(0, 2)],
            },
        ];

        let mut doc_bytes = vec![];
        let mut hit_bytes = vec![];
        encode_posting_list(&entries, &mut doc_bytes, &mut hit_bytes).unwrap();

        let mut reader = DocStreamReader::new(&doc_bytes).unwrap();

        let doc0 = reader.next().unwrap().unwrap();
        assert_eq!(doc0.row_id, 0);
        assert_eq!(doc0.hit_count, 3);
        assert_eq!(doc0.inline_position, None);
        let positions = read_hits(&hit_bytes, doc0.hit_ref, doc0.hit_count).unwrap();
        assert_eq!(positions, vec![1, 5, 9]);

        let doc1 = reader.next().unwrap().unwrap();
        assert_eq!(doc1.row_id, 4);
        assert_eq!(doc1.inline_position, Some(2));

        assert!(reader.next().is_none());
    }

    #[test]
    fn checkpoint_monotonic_check() {
        let good = vec![
            WordCheckpoint { keyword_index: 0, word_stream_offset: 0, doc_stream_offset: 0 },
            WordCheckpoint { keyword_index: 48, word_stream_offset: 512, doc_stream_offset: 900 },
        ];
        assert!(checkpoints_are_monotonic(&good));

        let bad = vec![
            WordCheckpoint { keyword_index: 48, word_stream_offset: 512, doc_stream_offset: 900 },
            WordCheckpoint { keyword_index: 0, word_stream_offset: 0, doc_stream_offset: 0 },
        ];
        assert!(!checkpoints_are_monotonic(&bad));
    }
}
