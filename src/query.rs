// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query-snapshot readers: thin iterators the (external) query engine
//! drives to walk a segment's encoded posting lists, word checkpoints, and
//! infix blooms (spec §2's component table; given its own numbered design
//! home here since spec.md's §4.x subsections stop at §4.9).

use crate::coding::{decode_keyword_delta, decode_vlb, DecodeError};
use crate::segment::posting::{read_hits, DecodedDoc};
use crate::segment::PostingStore;
use crate::value::Keyword;
use std::io::Cursor;

/// Sequential reader over one keyword's doc stream. Re-exported under the
/// query-facing name; see [`crate::segment::posting::DocStreamReader`] for
/// the codec itself.
pub type RtDocReader<'a> = crate::segment::posting::DocStreamReader<'a>;

/// Sequential reader over a hit stream's delta-encoded positions, starting
/// at a given `hit_ref` byte offset (spec §4.1).
pub struct RtHitReader<'a> {
    cursor: Cursor<&'a [u8]>,
    remaining: u64,
    prev_position: i64,
}

impl<'a> RtHitReader<'a> {
    /// Creates a reader over `count` positions starting at `hit_ref` within
    /// `hit_stream`.
    #[must_use]
    pub fn new(hit_stream: &'a [u8], hit_ref: u64, count: u64) -> Self {
        Self { cursor: Cursor::new(&hit_stream[hit_ref as usize..]), remaining: count, prev_position: -1 }
    }
}

impl<'a> Iterator for RtHitReader<'a> {
    type Item = Result<u32, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match decode_vlb(&mut self.cursor) {
            Ok(delta) => {
                self.prev_position += 1 + delta as i64;
                Some(Ok(self.prev_position as u32))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Walks a [`PostingStore`]'s word stream in order, yielding each keyword
/// together with its fully decoded doc records. Keywords and doc records
/// must be consumed in lock-step: `next()` advances past exactly the bytes
/// the previous keyword's records occupied.
pub struct RtWordReader<'a> {
    store: &'a PostingStore,
    word_cursor: Cursor<&'a [u8]>,
    doc_offset: usize,
    previous_keyword: Vec<u8>,
    keyword_index: u32,
}

impl<'a> RtWordReader<'a> {
    /// Creates a reader over the start of `store`'s word stream.
    #[must_use]
    pub fn new(store: &'a PostingStore) -> Self {
        Self {
            store,
            word_cursor: Cursor::new(&store.word_stream),
            doc_offset: 0,
            previous_keyword: Vec::new(),
            keyword_index: 0,
        }
    }

    /// Creates a reader positioned at word checkpoint `checkpoint_index`,
    /// skipping directly to it without decoding everything before it
    /// (spec §3: checkpoints bound keyword lookup scans).
    #[must_use]
    pub fn seek_to_checkpoint(store: &'a PostingStore, checkpoint_index: usize) -> Option<Self> {
        let checkpoint = store.checkpoints.get(checkpoint_index)?;
        let mut word_cursor = Cursor::new(&store.word_stream);
        word_cursor.set_position(checkpoint.word_stream_offset);
        Some(Self {
            store,
            word_cursor,
            doc_offset: checkpoint.doc_stream_offset as usize,
            previous_keyword: Vec::new(),
            keyword_index: checkpoint.keyword_index,
        })
    }

    /// Index of the keyword this reader will yield next.
    #[must_use]
    pub fn keyword_index(&self) -> u32 {
        self.keyword_index
    }

    /// Resolves a decoded doc's hit positions, whether inline or stored in
    /// the hit stream.
    #[must_use]
    pub fn resolve_hits(&self, doc: &DecodedDoc) -> Vec<u32> {
        match doc.inline_position {
            Some(position) => vec![position],
            None => read_hits(&self.store.hit_stream, doc.hit_ref, doc.hit_count).unwrap_or_default(),
        }
    }
}

impl<'a> Iterator for RtWordReader<'a> {
    type Item = Result<(Keyword, Vec<DecodedDoc>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.keyword_index >= self.store.keyword_count {
            return None;
        }

        let keyword_bytes = match decode_keyword_delta(&mut self.word_cursor, &self.previous_keyword) {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e)),
        };
        self.previous_keyword = keyword_bytes.clone();
        self.keyword_index += 1;

        let mut doc_reader = match RtDocReader::new(&self.store.doc_stream[self.doc_offset..]) {
            Ok(reader) => reader,
            Err(e) => return Some(Err(e)),
        };

        let mut docs = Vec::with_capacity(doc_reader.remaining() as usize);
        for doc in &mut doc_reader {
            match doc {
                Ok(d) => docs.push(d),
                Err(e) => return Some(Err(e)),
            }
        }
        self.doc_offset += doc_reader.position() as usize;

        Some(Ok((Keyword::Bytes(keyword_bytes), docs)))
    }
}
