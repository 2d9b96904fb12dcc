// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The reader-visible snapshot pair and the mutex guarding its publication
//! (spec §4.4, §9 redesign note on manually-refcounted reader vectors).

use crate::collab::DiskChunkOps;
use crate::segment::RamSegment;
use std::sync::{Arc, Mutex};

/// An ordered pair of immutable vectors: disk chunks (oldest first) and RAM
/// segments. The *only* way readers ever see index state.
#[derive(Clone)]
pub struct Snapshot {
    /// Disk chunks, ordered by ascending chunk id.
    pub disk_chunks: Arc<Vec<Arc<dyn DiskChunkOps>>>,
    /// RAM segments, in no particular order (the merger/flusher select by
    /// row count, not position).
    pub ram_segments: Arc<Vec<Arc<RamSegment>>>,
}

impl Snapshot {
    /// An empty snapshot, the initial state of a freshly created index.
    #[must_use]
    pub fn empty() -> Self {
        Self { disk_chunks: Arc::new(Vec::new()), ram_segments: Arc::new(Vec::new()) }
    }

    /// Returns a copy of this snapshot with `ram_segments` replaced.
    #[must_use]
    pub fn with_ram_segments(&self, ram_segments: Vec<Arc<RamSegment>>) -> Self {
        Self { disk_chunks: Arc::clone(&self.disk_chunks), ram_segments: Arc::new(ram_segments) }
    }

    /// Returns a copy of this snapshot with `disk_chunks` replaced.
    #[must_use]
    pub fn with_disk_chunks(&self, disk_chunks: Vec<Arc<dyn DiskChunkOps>>) -> Self {
        Self { disk_chunks: Arc::new(disk_chunks), ram_segments: Arc::clone(&self.ram_segments) }
    }

    /// Total alive rows across every RAM segment (spec §8, invariant 7
    /// pre-condition: measured at flush-tagging time by the caller).
    #[must_use]
    pub fn ram_alive_rows(&self) -> u64 {
        self.ram_segments.iter().map(|s| u64::from(s.alive_count())).sum()
    }

    /// Finds the first RAM segment or disk chunk reporting a given doc id
    /// alive. RAM segments are checked before disk chunks, newest-looking
    /// first is not meaningful here since doc ids are unique among alive
    /// rows (spec §8, invariant 2) -- at most one segment/chunk can answer
    /// `Some`.
    #[must_use]
    pub fn find_alive_row_in_ram(&self, doc_id: crate::value::DocId) -> Option<(Arc<RamSegment>, crate::value::RowId)> {
        self.ram_segments.iter().find_map(|seg| seg.find_alive_row(doc_id).map(|row_id| (Arc::clone(seg), row_id)))
    }
}

/// Mutex-guarded holder of the current [`Snapshot`]. Only the serial
/// executor publishes new snapshots; any number of readers may call
/// [`SnapshotHolder::current`] concurrently (spec §4.4).
#[derive(Default)]
pub struct SnapshotHolder {
    inner: Mutex<Snapshot>,
}

impl SnapshotHolder {
    /// Creates a holder around an initial snapshot.
    #[must_use]
    pub fn new(initial: Snapshot) -> Self {
        Self { inner: Mutex::new(initial) }
    }

    /// Returns a cheap clone of the current snapshot, obtained under a
    /// brief lock (spec §4.4: "readers acquire the pair under a brief
    /// mutex, clone both Arcs, release the mutex").
    #[must_use]
    pub fn current(&self) -> Snapshot {
        self.inner.lock().expect("lock poisoned").clone()
    }

    /// Atomically installs `next` as the current snapshot. Must only be
    /// called from the serial executor (spec §4.4: "writers of the pair --
    /// only the serial executor").
    pub fn publish(&self, next: Snapshot) {
        let mut guard = self.inner.lock().expect("lock poisoned");
        *guard = next;
        log::debug!(
            "snapshot: published {} disk chunks, {} ram segments",
            guard.disk_chunks.len(),
            guard.ram_segments.len()
        );
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_store::{BlobPool, RowStore};
    use crate::segment::{DeadRowBitmap, PostingStore};
    use rustc_hash::FxHashMap;
    use test_log::test;

    fn tiny_segment(id: u64, doc_id: crate::value::DocId) -> Arc<RamSegment> {
        let mut rows = RowStore::new(1);
        rows.push_row(&[0]);
        let mut doc_id_index = FxHashMap::default();
        doc_id_index.insert(doc_id, 0);
        Arc::new(RamSegment::new(id, 1, rows, BlobPool::new(), PostingStore::default(), doc_id_index, DeadRowBitmap::new(1)))
    }

    #[test]
    fn publish_is_visible_to_new_readers_not_old_ones() {
        let holder = SnapshotHolder::new(Snapshot::empty());
        let before = holder.current();
        assert!(before.ram_segments.is_empty());

        let segment = tiny_segment(1, 42);
        holder.publish(Snapshot::empty().with_ram_segments(vec![segment]));

        let after = holder.current();
        assert_eq!(after.ram_segments.len(), 1);
        assert!(before.ram_segments.is_empty(), "the clone taken before publish must not see the new segment");
    }

    #[test]
    fn find_alive_row_in_ram_locates_the_owning_segment() {
        let holder = SnapshotHolder::new(Snapshot::empty());
        holder.publish(Snapshot::empty().with_ram_segments(vec![tiny_segment(1, 7), tiny_segment(2, 9)]));

        let snapshot = holder.current();
        let (segment, row_id) = snapshot.find_alive_row_in_ram(9).unwrap();
        assert_eq!(segment.id, 2);
        assert_eq!(row_id, 0);
        assert!(snapshot.find_alive_row_in_ram(123).is_none());
    }
}
