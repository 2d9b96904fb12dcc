// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Update and kill paths: fan attribute updates and deletes out across the
//! current snapshot's RAM segments and disk chunks (spec §4.7).

use crate::flusher::encode_row_words;
use crate::segment::PostponedUpdate;
use crate::snapshot::Snapshot;
use crate::value::DocId;

/// One attribute-update request: the doc id it targets and its new row
/// words (same stride as the segment/chunk's schema).
#[derive(Clone, Debug)]
pub struct AttributeChange {
    /// Doc id to update.
    pub doc_id: DocId,
    /// New row words.
    pub new_words: Vec<u32>,
}

/// Outcome of a batch of attribute updates.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Updates applied to a live RAM segment row.
    pub ram_applied: usize,
    /// Updates applied via a disk chunk's best-effort API.
    pub disk_applied: usize,
    /// Doc ids not found alive anywhere.
    pub not_found: Vec<DocId>,
}

/// Applies `changes` to the current snapshot (spec §4.7 steps 1-3).
///
/// For each change: every RAM segment is checked for the doc id; if found,
/// the change is applied under that segment's write lock, and if the
/// segment is mid-merge/mid-flush (tagged with a non-zero op ticket) the
/// change is *also* queued as a [`PostponedUpdate`] so the successor
/// artifact picks it up. If no RAM segment has the doc id, disk chunks are
/// tried newest-to-oldest via their own best-effort update API.
pub fn apply_updates(snapshot: &Snapshot, changes: &[AttributeChange]) -> UpdateReport {
    let mut report = UpdateReport::default();

    'changes: for change in changes {
        for segment in snapshot.ram_segments.iter() {
            if let Some(row_id) = segment.find_alive_row(change.doc_id) {
                segment.apply_update(row_id, &change.new_words);
                report.ram_applied += 1;

                if segment.op_ticket() != 0 {
                    segment.postpone_update(PostponedUpdate { doc_id: change.doc_id, row_id, new_words: change.new_words.clone() });
                    log::trace!("update: postponed doc {} on busy segment {}", change.doc_id, segment.id);
                }
                continue 'changes;
            }
        }

        for chunk in snapshot.disk_chunks.iter().rev() {
            match chunk.update_attributes(change.doc_id, &encode_row_words(&change.new_words)) {
                Ok(true) => {
                    report.disk_applied += 1;
                    continue 'changes;
                }
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("update: disk chunk {} failed to apply update for doc {}: {e}", chunk.id(), change.doc_id);
                    continue;
                }
            }
        }

        report.not_found.push(change.doc_id);
    }

    report
}

/// Outcome of a kill-list application.
#[derive(Debug, Default)]
pub struct KillReport {
    /// Total doc ids actually killed (were alive somewhere) in RAM.
    pub ram_killed: u64,
    /// Total doc ids actually killed in disk chunks.
    pub disk_killed: u64,
}

/// Applies `doc_ids` as kills across every RAM segment and disk chunk in
/// the snapshot (spec §4.7 "Kill"). Idempotent: doc ids already dead
/// everywhere contribute zero.
pub fn kill_everywhere(snapshot: &Snapshot, doc_ids: &[DocId]) -> KillReport {
    let mut report = KillReport::default();

    for segment in snapshot.ram_segments.iter() {
        report.ram_killed += u64::from(segment.kill_multi(doc_ids));
    }

    for chunk in snapshot.disk_chunks.iter() {
        match chunk.kill_multi(doc_ids) {
            Ok(count) => report.disk_killed += count,
            Err(e) => log::warn!("update: disk chunk {} failed kill_multi: {e}", chunk.id()),
        }
    }

    report
}
