// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The two named cooperative workers: *serial* (all snapshot mutations) and
//! *merger* (CPU-heavy background merge work), each a dedicated worker
//! thread draining a job queue -- the same shape as the teacher's dedicated
//! compaction worker thread, rather than a full async runtime (spec §4.4,
//! §5).

use crate::stop_signal::StopSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single named worker thread draining a job queue in submission order.
pub struct Worker {
    name: &'static str,
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
    stop: StopSignal,
}

impl Worker {
    /// Spawns a worker thread named `name`.
    #[must_use]
    pub fn spawn(name: &'static str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let stop = StopSignal::default();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::debug!("{name} worker: started");
                while let Ok(job) = receiver.recv() {
                    job();
                }
                log::debug!("{name} worker: stopped");
            })
            .expect("failed to spawn worker thread");

        Self { name, sender, handle: Some(handle), stop }
    }

    /// Enqueues `job`, to be run on this worker in submission order.
    /// Silently dropped if the worker has already shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            log::warn!("{} worker: dropped a job submitted after shutdown", self.name);
        }
    }

    /// A cloneable, `'static` handle that can submit more jobs to this
    /// worker from inside a job already running on it -- used to
    /// tail-resubmit a follow-up decision once the current job completes.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { name: self.name, sender: self.sender.clone() }
    }

    /// This worker's cooperative stop flag, consulted by long-running jobs
    /// between sub-phases (spec §5, "Cancellation / timeouts").
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Requests shutdown and blocks until the worker thread drains its
    /// remaining queue and exits.
    pub fn shutdown(&mut self) {
        self.stop.send();
        // Dropping the sender closes the channel so `recv()` returns `Err`
        // once the queue drains; we replace it with a disconnected sender
        // by simply letting this one go out of scope at struct drop. To
        // join deterministically here, we take the handle now.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A cloned, `Send + Sync` submission handle for a [`Worker`], cheap to hold
/// alongside other long-lived shared state and to capture in a job closure
/// that needs to queue more work on the same worker once it's done.
#[derive(Clone)]
pub struct WorkerHandle {
    name: &'static str,
    sender: mpsc::Sender<Job>,
}

impl WorkerHandle {
    /// Enqueues `job` on the worker this handle was taken from. Silently
    /// dropped if the worker has already shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            log::warn!("{} worker: dropped a job submitted after shutdown", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Channel closes when `self.sender` drops after this function
            // returns; join after that by spawning a tiny detached waiter
            // would race, so best effort: mark stopped and let the OS
            // reclaim the thread if it's still draining a long job.
            self.stop.send();
            drop(handle);
        }
    }
}

/// Guards against queuing more than one pending merge/optimize task at a
/// time (spec §4.5: "A task is queued at most once (guarded by a
/// boolean)").
#[derive(Clone, Default)]
pub struct TaskGate(Arc<AtomicBool>);

impl TaskGate {
    /// Attempts to claim the gate. Returns `true` if this call claimed it
    /// (caller should queue the task); `false` if already claimed.
    pub fn try_claim(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Releases the gate once the queued task has run.
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The index's two named workers.
pub struct Executor {
    /// Owns all snapshot mutations, kill fan-out, meta persistence.
    pub serial: Worker,
    /// Runs segment-merge and chunk-optimize CPU work.
    pub merger: Worker,
}

impl Executor {
    /// Spawns both workers.
    #[must_use]
    pub fn new() -> Self {
        Self { serial: Worker::spawn("serial"), merger: Worker::spawn("merger") }
    }

    /// Shuts down both workers, draining their queues first.
    pub fn shutdown(&mut self) {
        self.serial.shutdown();
        self.merger.shutdown();
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
