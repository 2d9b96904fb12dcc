// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The top-level index manager: wires the accumulator, snapshot, executor,
//! merger, flusher, optimizer and persistence together behind one
//! singleton with an explicit lifecycle (spec §9: replaces the
//! `RTChangesAllowed` / auto-optimize-cutoff globals with fields owned by
//! this struct, built at startup and torn down at shutdown).

use crate::accumulator::Accumulator;
use crate::collab::DiskChunkOps;
use crate::config::Config;
use crate::executor::{Executor, TaskGate, WorkerHandle};
use crate::flusher::{self, FlushKillCollector};
use crate::merger::{self, Decision};
use crate::optimizer::{AutoOptimizer, ChunkId, OptimizeStep};
use crate::persistence::MetaFile;
use crate::segment::{KillHook, RamSegment, SegmentId};
use crate::snapshot::{Snapshot, SnapshotHolder};
use crate::ticket::TicketCounter;
use crate::update::{self, AttributeChange, KillReport, UpdateReport};
use crate::value::DocId;
use rustc_hash::FxHashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Allocates fresh, empty disk chunks on demand. The chunk's own on-disk
/// format is opaque to this core (spec §1); this factory is the boundary
/// through which the index manager obtains new [`DiskChunkOps`] instances
/// to hand to the flusher/optimizer without knowing how they're built.
pub trait DiskChunkFactory: Send + Sync {
    /// Creates a new, not-yet-preallocated chunk identified by `chunk_id`.
    fn create(&self, chunk_id: ChunkId) -> Arc<dyn DiskChunkOps>;
}

/// Outcome of one [`IndexManager::commit`].
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Doc ids killed by this transaction, in RAM.
    pub ram_killed: u64,
    /// Doc ids killed by this transaction, in disk chunks.
    pub disk_killed: u64,
    /// `true` if the accumulator staged at least one surviving document and
    /// a new RAM segment was published.
    pub segment_published: bool,
}

/// State reachable from jobs submitted to the merger worker. `Arc`-wrapped
/// so a `'static` job closure can own a handle to it without borrowing
/// `IndexManager` itself (spec §5: the merger/flusher/optimizer run on a
/// dedicated worker thread, not inline with the caller).
struct Shared {
    name: String,
    config: Config,
    schema_fingerprint: u64,
    chunk_factory: Arc<dyn DiskChunkFactory>,
    /// A submission handle for the merger worker, held here (not just on
    /// [`IndexManager`]) so a job already running on that worker can queue
    /// its own follow-up decision pass once it completes (spec §4.5 step 7).
    merger: WorkerHandle,

    snapshot: SnapshotHolder,
    tickets: TicketCounter,

    next_segment_id: AtomicU64,
    next_chunk_id: AtomicU64,
    last_tid: AtomicU64,

    /// RAM used by RAM segments, spec §5 "one global counter ... updated
    /// relaxed".
    ram_used: AtomicU64,
    /// Gates the tighter double-buffer RAM limit while a flush is running
    /// (spec §5 "Save-active counter").
    save_active: AtomicU64,

    merge_gate: TaskGate,
}

impl Shared {
    fn meta_path(&self) -> PathBuf {
        self.config.path.join(format!("{}.meta", self.name))
    }

    fn ram_path(&self) -> PathBuf {
        self.config.path.join(format!("{}.ram", self.name))
    }
}

/// The index-wide singleton (spec §4.4-§4.9, §5). Owns every piece of
/// mutable, process-lifetime state the core needs outside of a snapshot:
/// the RAM budget counter, the id counters, the op-ticket counter, the
/// task gates, and the explicit changes-allowed flag.
pub struct IndexManager {
    shared: Arc<Shared>,
    stride: usize,
    doc_id_word_offset: usize,
    dictionary_in_use: bool,
    executor: Executor,
    optimize_gate: TaskGate,

    /// Explicit lifecycle flag (spec §9): writes are rejected once this is
    /// cleared, e.g. during a coordinated shutdown or a maintenance window.
    changes_allowed: AtomicBool,
}

impl IndexManager {
    /// Builds a fresh, empty index manager. Does not read or write any
    /// files; call [`IndexManager::save`] / [`IndexManager::load`] to
    /// persist or recover state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: Config,
        stride: usize,
        doc_id_word_offset: usize,
        dictionary_in_use: bool,
        schema_fingerprint: u64,
        chunk_factory: Arc<dyn DiskChunkFactory>,
    ) -> Self {
        let executor = Executor::new();
        let shared = Arc::new(Shared {
            name: name.into(),
            config,
            schema_fingerprint,
            chunk_factory,
            merger: executor.merger.handle(),
            snapshot: SnapshotHolder::new(Snapshot::empty()),
            tickets: TicketCounter::default(),
            next_segment_id: AtomicU64::new(0),
            next_chunk_id: AtomicU64::new(0),
            last_tid: AtomicU64::new(0),
            ram_used: AtomicU64::new(0),
            save_active: AtomicU64::new(0),
            merge_gate: TaskGate::default(),
        });

        Self {
            shared,
            stride,
            doc_id_word_offset,
            dictionary_in_use,
            executor,
            optimize_gate: TaskGate::default(),
            changes_allowed: AtomicBool::new(true),
        }
    }

    /// A cheap, consistent read-only view for queries (spec §4.4).
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.current()
    }

    /// Disables new commits/updates/kills. Existing background merge,
    /// flush and optimize jobs already queued are allowed to drain (spec
    /// §9 "explicit lifecycle").
    pub fn disallow_changes(&self) {
        self.changes_allowed.store(false, Ordering::Release);
    }

    /// Re-enables commits/updates/kills.
    pub fn allow_changes(&self) {
        self.changes_allowed.store(true, Ordering::Release);
    }

    fn ensure_changes_allowed(&self) -> crate::Result<()> {
        if self.changes_allowed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(crate::Error::Fatal("changes are not allowed right now".to_string()))
        }
    }

    /// Applies `accumulator`'s staged kills, then its staged documents,
    /// publishing a new snapshot if a segment resulted (spec §4.4 steps,
    /// §5 "kills are applied before the new segment is published").
    pub fn commit(&self, accumulator: &mut Accumulator) -> crate::Result<CommitReport> {
        self.ensure_changes_allowed()?;

        let kills = accumulator.take_kill_list();
        let current = self.shared.snapshot.current();
        let kill_report = if kills.is_empty() { KillReport::default() } else { update::kill_everywhere(&current, &kills) };

        let segment_id = self.shared.next_segment_id.fetch_add(1, Ordering::AcqRel);
        let segment = accumulator.commit(segment_id, &self.shared.config, self.dictionary_in_use)?;

        let segment_published = match segment {
            Some(segment) => {
                self.shared.ram_used.fetch_add(segment.used_ram(), Ordering::Relaxed);
                let mut ram_segments = (*current.ram_segments).clone();
                ram_segments.push(Arc::new(segment));
                self.shared.snapshot.publish(current.with_ram_segments(ram_segments));
                true
            }
            None => false,
        };

        Self::maybe_schedule_merge_or_flush(&self.shared);

        Ok(CommitReport { ram_killed: kill_report.ram_killed, disk_killed: kill_report.disk_killed, segment_published })
    }

    /// Applies best-effort attribute updates across the current snapshot
    /// (spec §4.7).
    pub fn apply_updates(&self, changes: &[AttributeChange]) -> crate::Result<UpdateReport> {
        self.ensure_changes_allowed()?;
        Ok(update::apply_updates(&self.shared.snapshot.current(), changes))
    }

    /// Kills `doc_ids` everywhere in the current snapshot (spec §4.7).
    pub fn kill(&self, doc_ids: &[DocId]) -> crate::Result<KillReport> {
        self.ensure_changes_allowed()?;
        Ok(update::kill_everywhere(&self.shared.snapshot.current(), doc_ids))
    }

    /// Consults the merger's policy and schedules a merge or flush on the
    /// merger worker if warranted; each completion handler calls this again
    /// once its job is done, tail-resubmitting the next decision pass in
    /// case more merging is useful (spec §4.5 step 7) -- it keeps running
    /// until `merger::decide` reports [`Decision::NoMerge`] with no call
    /// needing `&IndexManager` itself, since a job already on the merger
    /// worker only ever holds `Arc<Shared>`.
    fn maybe_schedule_merge_or_flush(shared: &Arc<Shared>) {
        if !shared.merge_gate.try_claim() {
            return;
        }

        let current = shared.snapshot.current();
        let flush_in_flight = shared.save_active.load(Ordering::Acquire) > 0;
        let decision = merger::decide(&current.ram_segments, shared.ram_used.load(Ordering::Relaxed), &shared.config, flush_in_flight);

        match decision {
            Decision::NoMerge => shared.merge_gate.release(),
            Decision::Merge(i, j) => {
                let a = Arc::clone(&current.ram_segments[i]);
                let b = Arc::clone(&current.ram_segments[j]);
                Self::submit_merge(shared, a, b);
            }
            Decision::Flush => Self::submit_flush(shared),
        }
    }

    fn submit_merge(shared: &Arc<Shared>, a: Arc<RamSegment>, b: Arc<RamSegment>) {
        let ticket = shared.tickets.next();
        let new_id = shared.next_segment_id.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(shared);

        shared.merger.submit(move || {
            let collector: Arc<FlushKillCollector> = Arc::new(FlushKillCollector::default());
            a.tag_for_op(ticket, Some(Arc::clone(&collector) as Arc<dyn KillHook>));
            b.tag_for_op(ticket, Some(Arc::clone(&collector) as Arc<dyn KillHook>));

            match merger::merge_segments(&a, &b, new_id, ticket, &shared.config) {
                Ok(merged) => {
                    let kills_during = collector.drain();
                    merged.kill_multi(&kills_during);

                    let mut postponed = a.drain_postponed_updates();
                    postponed.extend(b.drain_postponed_updates());
                    for update in postponed {
                        if let Some(row_id) = merged.find_alive_row(update.doc_id) {
                            merged.apply_update(row_id, &update.new_words);
                        }
                    }

                    a.clear_op_tag();
                    b.clear_op_tag();

                    let current = shared.snapshot.current();
                    let mut ram_segments: Vec<Arc<RamSegment>> =
                        current.ram_segments.iter().filter(|s| s.id != a.id && s.id != b.id).cloned().collect();

                    shared.ram_used.fetch_sub(a.used_ram().saturating_add(b.used_ram()), Ordering::Relaxed);
                    if merged.alive_count() > 0 {
                        shared.ram_used.fetch_add(merged.used_ram(), Ordering::Relaxed);
                        ram_segments.push(Arc::new(merged));
                    } else {
                        log::debug!("merger: merge of segments {} and {} killed every row, dropping result", a.id, b.id);
                    }

                    shared.snapshot.publish(current.with_ram_segments(ram_segments));
                }
                Err(e) => {
                    log::warn!("merger: merge of segments {} and {} failed: {e}", a.id, b.id);
                    a.clear_op_tag();
                    b.clear_op_tag();
                }
            }

            shared.merge_gate.release();
            Self::maybe_schedule_merge_or_flush(&shared);
        });
    }

    fn submit_flush(shared: &Arc<Shared>) {
        shared.save_active.fetch_add(1, Ordering::AcqRel);
        let chunk_id = shared.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let chunk = shared.chunk_factory.create(chunk_id);
        let ticket = shared.tickets.next();
        let shared = Arc::clone(shared);

        shared.merger.submit(move || {
            let current = shared.snapshot.current();
            let segments = flusher::select_unclaimed(&current.ram_segments);

            match flusher::flush(&segments, chunk.as_ref(), ticket, shared.schema_fingerprint) {
                Ok(_report) => {
                    let flushed_ram: u64 = segments.iter().map(RamSegment::used_ram).sum();
                    shared.ram_used.fetch_sub(flushed_ram, Ordering::Relaxed);

                    let flushed_ids: FxHashSet<SegmentId> = segments.iter().map(|s| s.id).collect();
                    let remaining: Vec<Arc<RamSegment>> = current.ram_segments.iter().filter(|s| !flushed_ids.contains(&s.id)).cloned().collect();

                    let mut disk_chunks = (*current.disk_chunks).clone();
                    disk_chunks.push(chunk);

                    shared.snapshot.publish(Snapshot { disk_chunks: Arc::new(disk_chunks), ram_segments: Arc::new(remaining) });
                    log::info!("flusher: published new disk chunk {chunk_id} from {} segments", segments.len());
                }
                Err(e) => log::warn!("flusher: flush into chunk {chunk_id} failed: {e}"),
            }

            shared.save_active.fetch_sub(1, Ordering::AcqRel);
            shared.merge_gate.release();
            Self::maybe_schedule_merge_or_flush(&shared);
        });
    }

    /// Runs the progressive auto-optimize loop to completion (or until the
    /// merger worker's stop flag fires), one step at a time (spec §4.8
    /// "auto"). Intended to be invoked on the merger worker; callers
    /// running it inline should expect it to block for the duration of the
    /// pass.
    pub fn optimize_auto(&self) -> crate::Result<()> {
        if !self.optimize_gate.try_claim() {
            return Ok(());
        }

        let stop = self.executor.merger.stop_signal();
        let mut optimizer = AutoOptimizer::new(self.shared.config.auto_optimize_cutoff, stop);

        loop {
            let current = self.shared.snapshot.current();
            let chunks: Vec<Arc<dyn DiskChunkOps>> = (*current.disk_chunks).clone();
            match optimizer.next_step(&chunks) {
                OptimizeStep::Done => break,
                OptimizeStep::Drop(id) => self.apply_drop(id)?,
                OptimizeStep::Compress(id) => self.apply_compress(id)?,
                OptimizeStep::Merge { newer, older } => self.apply_merge_chunks(newer, older)?,
                OptimizeStep::Split(id, filter) => self.apply_split(id, &filter)?,
            }
        }

        self.optimize_gate.release();
        Ok(())
    }

    fn apply_drop(&self, id: ChunkId) -> crate::Result<()> {
        let current = self.shared.snapshot.current();
        let Some(chunk) = current.disk_chunks.iter().find(|c| c.id() == id).cloned() else { return Ok(()) };
        chunk.unlink()?;
        let remaining: Vec<Arc<dyn DiskChunkOps>> = current.disk_chunks.iter().filter(|c| c.id() != id).cloned().collect();
        self.shared.snapshot.publish(current.with_disk_chunks(remaining));
        Ok(())
    }

    fn apply_compress(&self, id: ChunkId) -> crate::Result<()> {
        let current = self.shared.snapshot.current();
        let Some(source) = current.disk_chunks.iter().find(|c| c.id() == id).cloned() else { return Ok(()) };

        let target_id = self.shared.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let target = self.shared.chunk_factory.create(target_id);
        target.preallocate(self.shared.schema_fingerprint)?;
        source.compress_into(target.as_ref())?;
        target.rename_into_place()?;

        let current = self.shared.snapshot.current();
        let replaced: Vec<Arc<dyn DiskChunkOps>> =
            current.disk_chunks.iter().map(|c| if c.id() == id { Arc::clone(&target) } else { Arc::clone(c) }).collect();
        self.shared.snapshot.publish(current.with_disk_chunks(replaced));
        source.unlink()
    }

    fn apply_merge_chunks(&self, newer_id: ChunkId, older_id: ChunkId) -> crate::Result<()> {
        let current = self.shared.snapshot.current();
        let Some(newer) = current.disk_chunks.iter().find(|c| c.id() == newer_id).cloned() else { return Ok(()) };
        let Some(older) = current.disk_chunks.iter().find(|c| c.id() == older_id).cloned() else { return Ok(()) };

        let target_id = self.shared.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let target = self.shared.chunk_factory.create(target_id);
        target.preallocate(self.shared.schema_fingerprint)?;
        newer.merge_older_into(older.as_ref(), target.as_ref())?;
        target.rename_into_place()?;

        let current = self.shared.snapshot.current();
        let mut remaining: Vec<Arc<dyn DiskChunkOps>> =
            current.disk_chunks.iter().filter(|c| c.id() != newer_id && c.id() != older_id).cloned().collect();
        remaining.push(Arc::clone(&target));
        self.shared.snapshot.publish(current.with_disk_chunks(remaining));

        newer.unlink()?;
        older.unlink()
    }

    fn apply_split(&self, id: ChunkId, filter: &crate::optimizer::SplitFilter) -> crate::Result<()> {
        let current = self.shared.snapshot.current();
        let Some(source) = current.disk_chunks.iter().find(|c| c.id() == id).cloned() else { return Ok(()) };

        let left_id = self.shared.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let right_id = self.shared.next_chunk_id.fetch_add(1, Ordering::AcqRel);
        let left = self.shared.chunk_factory.create(left_id);
        let right = self.shared.chunk_factory.create(right_id);
        left.preallocate(self.shared.schema_fingerprint)?;
        right.preallocate(self.shared.schema_fingerprint)?;

        match crate::optimizer::split(source.as_ref(), left.as_ref(), right.as_ref(), filter) {
            Ok(_) => {
                left.rename_into_place()?;
                right.rename_into_place()?;
                let current = self.shared.snapshot.current();
                let mut remaining: Vec<Arc<dyn DiskChunkOps>> = current.disk_chunks.iter().filter(|c| c.id() != id).cloned().collect();
                remaining.push(Arc::clone(&left));
                remaining.push(Arc::clone(&right));
                self.shared.snapshot.publish(current.with_disk_chunks(remaining));
                source.unlink()
            }
            Err(e) => {
                log::warn!("optimizer: split of chunk {id} aborted: {e}");
                left.unlink()?;
                right.unlink()
            }
        }
    }

    /// Persists `.meta` and `.ram` atomically (spec §4.9).
    pub fn save(&self) -> crate::Result<()> {
        let current = self.shared.snapshot.current();

        let meta = MetaFile {
            total_rows: current.ram_segments.iter().map(|s| u64::from(s.u_rows())).sum::<u64>()
                + current.disk_chunks.iter().map(|c| c.get_status().total_rows).sum::<u64>(),
            last_tid: self.shared.last_tid.load(Ordering::Acquire),
            schema_fingerprint: self.shared.schema_fingerprint,
            checkpoint_stride: self.shared.config.checkpoint_stride,
            infix_bloom: self.shared.config.infix_bloom,
            disk_chunk_ids: current.disk_chunks.iter().map(|c| c.id()).collect(),
            ram_soft_limit: self.shared.config.ram_soft_limit,
        };
        meta.save(&self.shared.meta_path())?;
        crate::persistence::save_ram(&self.shared.ram_path(), &current.ram_segments)?;
        Ok(())
    }

    /// Recovers state from `.meta`/`.ram`, preallocating every listed disk
    /// chunk via `chunk_factory` and verifying schema compatibility (spec
    /// §4.9 "Startup").
    pub fn load(
        name: impl Into<String>,
        config: Config,
        stride: usize,
        doc_id_word_offset: usize,
        dictionary_in_use: bool,
        schema_fingerprint: u64,
        chunk_factory: Arc<dyn DiskChunkFactory>,
    ) -> crate::Result<Self> {
        let manager = Self::new(name, config, stride, doc_id_word_offset, dictionary_in_use, schema_fingerprint, chunk_factory);

        let meta = MetaFile::load(&manager.shared.meta_path())?;
        if meta.schema_fingerprint != manager.shared.schema_fingerprint {
            return Err(crate::Error::SchemaMismatch);
        }
        manager.shared.last_tid.store(meta.last_tid, Ordering::Release);

        let mut disk_chunks: Vec<Arc<dyn DiskChunkOps>> = Vec::with_capacity(meta.disk_chunk_ids.len());
        let mut max_chunk_id = 0u64;
        for &chunk_id in &meta.disk_chunk_ids {
            let chunk = manager.shared.chunk_factory.create(chunk_id);
            chunk.preallocate(manager.shared.schema_fingerprint)?;
            max_chunk_id = max_chunk_id.max(chunk_id);
            disk_chunks.push(chunk);
        }
        manager.shared.next_chunk_id.store(max_chunk_id + 1, Ordering::Release);

        let ram_segments = crate::persistence::load_ram(&manager.shared.ram_path(), manager.doc_id_word_offset)?;
        let max_segment_id = ram_segments.iter().map(|s| s.id).max().unwrap_or(0);
        manager.shared.next_segment_id.store(if ram_segments.is_empty() { 0 } else { max_segment_id + 1 }, Ordering::Release);

        let ram_used: u64 = ram_segments.iter().map(RamSegment::used_ram).sum();
        manager.shared.ram_used.store(ram_used, Ordering::Relaxed);

        manager.shared.snapshot.publish(Snapshot { disk_chunks: Arc::new(disk_chunks), ram_segments: Arc::new(ram_segments) });

        Ok(manager)
    }

    /// Shuts down both workers, draining queued merge/flush/optimize jobs.
    pub fn shutdown(&mut self) {
        self.disallow_changes();
        self.executor.shutdown();
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
