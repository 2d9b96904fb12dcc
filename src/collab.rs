// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Trait boundaries for the collaborators the core consumes but does not
//! implement: tokenizer, dictionary, field filter, columnar backend,
//! docstore, blob-row builder, the opaque disk-chunk contract, and the
//! write-ahead log (spec §6). Each trait owns its own failure enum rather
//! than folding into [`crate::Error`], per the redesign note in spec §9.

use crate::value::{DocId, Hit, RowId};

/// Produces `(field, position, word-or-wordid)` hits from a field payload.
/// Implementations must be cheap to clone per worker thread.
pub trait Tokenizer: Send + Sync {
    /// Opaque fingerprint of this tokenizer's settings, used to detect
    /// configuration drift across restarts.
    fn settings_fingerprint(&self) -> u64;

    /// Tokenizes one field's raw bytes into hits appended to `out`.
    fn tokenize(&self, field: u8, payload: &[u8], row_id: RowId, out: &mut Vec<Hit>);
}

/// Maps words to word ids or to packed-word bytes.
pub trait Dictionary: Send + Sync {
    /// Whether this dictionary applies morphology (stemming/lemmatization),
    /// which affects whether keyword-level round-tripping is meaningful.
    fn has_morphology(&self) -> bool;

    /// Looks up a word's id, if the dictionary assigns ids rather than
    /// storing raw bytes.
    fn lookup(&self, word: &[u8]) -> Option<u64>;
}

/// Maps raw field bytes to normalized bytes before tokenization.
pub trait FieldFilter: Send + Sync {
    /// Normalizes `input` in place (or replaces it), e.g. Unicode folding,
    /// regex-based rewrites.
    fn normalize(&self, input: &[u8]) -> Vec<u8>;
}

/// Errors a columnar backend can raise.
#[derive(Debug)]
pub enum ColumnarError {
    /// The backend's own I/O or format error, opaque to the core.
    Backend(String),
}

/// Accepts per-row columnar values during segment construction.
pub trait ColumnarBuilder {
    /// Appends one row's columnar values (encoding is backend-defined).
    fn add_row(&mut self, row_id: RowId, values: &[u8]) -> Result<(), ColumnarError>;

    /// Finalizes and returns the serialized columnar store bytes.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, ColumnarError>;
}

/// Row-iterator API over an already-built columnar store; used by the
/// segment's doc-id-hash builder when the doc-id attribute is columnar
/// (spec §4.2, "Build-time map").
pub trait ColumnarStore {
    /// Iterates `(row_id, doc_id)` pairs in row order.
    fn iter_doc_ids(&self) -> Box<dyn Iterator<Item = (RowId, DocId)> + '_>;
}

/// Errors a docstore backend can raise.
#[derive(Debug)]
pub enum DocstoreError {
    /// The backend's own I/O or format error, opaque to the core.
    Backend(String),
}

/// Optional per-row stored-fields backend.
pub trait Docstore {
    /// Adds one row's stored fields.
    fn add_doc(&mut self, row_id: RowId, fields: &[u8]) -> Result<(), DocstoreError>;

    /// Fetches a row's stored fields.
    fn get_doc(&self, row_id: RowId) -> Result<Option<Vec<u8>>, DocstoreError>;

    /// Persists the docstore to its backing file(s).
    fn save(&self) -> Result<(), DocstoreError>;

    /// Loads a docstore from its backing file(s).
    fn load(path: &std::path::Path) -> Result<Box<dyn Docstore>, DocstoreError>
    where
        Self: Sized;
}

/// Accepts typed attribute values for one row and returns a single blob-pool
/// offset to store in the row store (spec §3, Blob pool).
pub trait BlobRowBuilder {
    /// Appends one row's variable-length attribute payloads, returning the
    /// offset into the blob pool where they were written.
    fn add_row(&mut self, payloads: &[&[u8]]) -> u64;
}

/// Status snapshot reported by a disk chunk.
#[derive(Clone, Debug, Default)]
pub struct DiskChunkStatus {
    /// Number of alive rows as of the last `kill_multi`/`update_attributes`.
    pub alive_rows: u64,
    /// Total rows ever written to the chunk (alive + dead).
    pub total_rows: u64,
    /// On-disk size in bytes.
    pub disk_bytes: u64,
}

/// The opaque contract the core requires from a disk chunk (spec §6). The
/// chunk's own inverted-index format is out of scope; the core only drives
/// these operations.
pub trait DiskChunkOps: Send + Sync {
    /// Numeric chunk id, strictly monotonic and unique across the index.
    fn id(&self) -> u64;

    /// Preallocates the chunk's on-disk files as a fresh index; verifies
    /// schema compatibility with the caller's schema fingerprint.
    fn preallocate(&self, schema_fingerprint: u64) -> crate::Result<()>;

    /// Ingests a set of RAM segments into this chunk's own on-disk format:
    /// attribute file, dictionary/docs/hits/skiplist (sorted-merged across
    /// `segments`), dead-row map, header. Opaque to the core: the chunk's
    /// inverted-index layout is entirely its own concern (spec §4.6 steps
    /// 3-6).
    fn build_from_segments(&self, segments: &[std::sync::Arc<crate::segment::RamSegment>], schema_fingerprint: u64) -> crate::Result<()>;

    /// Renames temp artifacts into their final names.
    fn rename_into_place(&self) -> crate::Result<()>;

    /// Unlinks this chunk's files from disk. Only called once the chunk is
    /// unreachable from every snapshot and its finally-unlink flag is set.
    fn unlink(&self) -> crate::Result<()>;

    /// Kills a batch of doc ids; returns how many were actually alive.
    fn kill_multi(&self, doc_ids: &[DocId]) -> crate::Result<u64>;

    /// Applies a best-effort attribute update; failures are reported but do
    /// not roll back other already-applied updates (spec §7).
    fn update_attributes(&self, doc_id: DocId, changes: &[u8]) -> crate::Result<bool>;

    /// Persists any pending in-place attribute changes.
    fn save_attributes(&self) -> crate::Result<()>;

    /// Current status (alive rows, total rows, disk size).
    fn get_status(&self) -> DiskChunkStatus;

    /// Free-form stats blob for diagnostics/monitoring.
    fn get_stats(&self) -> Vec<(String, u64)>;

    /// Adds or removes a scalar attribute from the chunk's schema.
    fn add_remove_attribute(&self, name: &str, add: bool) -> crate::Result<()>;

    /// Adds or removes a stored field from the chunk's schema.
    fn add_remove_field(&self, name: &str, add: bool) -> crate::Result<()>;

    /// Per-field total token-length accumulators, for scoring.
    fn get_field_lens(&self) -> Vec<(u8, u64)>;

    /// Rewrites this chunk's live rows into `target`, dropping dead rows
    /// (optimizer **compress**, spec §4.8).
    fn compress_into(&self, target: &dyn DiskChunkOps) -> crate::Result<()>;

    /// Rewrites this chunk and `older` (the chunk being folded in) into
    /// `target`; `older`'s rows are the ones being merged *into* `self`'s
    /// id space, per the order-preserving rule in spec §4.8.
    fn merge_older_into(&self, older: &dyn DiskChunkOps, target: &dyn DiskChunkOps) -> crate::Result<()>;

    /// Splits this chunk's live rows into `left` and `right` by `filter`.
    /// Returns the doc ids `filter` routed to neither half; a non-empty
    /// result means the split was aborted and neither `left` nor `right`
    /// was actually populated (spec §9 Open Question 2 resolution: the
    /// split contract requires full coverage or it aborts cleanly).
    fn split_by(&self, left: &dyn DiskChunkOps, right: &dyn DiskChunkOps, filter: &dyn Fn(DocId) -> bool) -> crate::Result<Vec<DocId>>;
}

/// Errors the write-ahead log collaborator can raise.
#[derive(Debug)]
pub enum WalError {
    /// The WAL's own I/O or format error, opaque to the core.
    Backend(String),
}

/// External durability collaborator: appends committed transactions and
/// replays them at startup (spec §4.9 "Recovery via WAL").
pub trait WriteAheadLog {
    /// Appends a serialized transaction, returning its assigned
    /// transaction id via `tid_out` and invoking `callback` once durable.
    fn commit(
        &self,
        tid_out: &mut u64,
        name: &str,
        callback: &mut dyn FnMut() -> crate::Result<()>,
    ) -> Result<(), WalError>;

    /// Replays every committed transaction since the last checkpoint.
    fn replay(&self, callback: &mut dyn FnMut(&[u8]) -> crate::Result<bool>) -> Result<(), WalError>;

    /// Notifies the WAL that the index durably flushed up to `tid`, so it
    /// may reclaim log segments older than it, unless `interrupted`.
    fn notify_index_flush(&self, name: &str, tid: u64, interrupted: bool) -> Result<(), WalError>;
}
