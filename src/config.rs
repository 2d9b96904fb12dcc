// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Index configuration: RAM budget, word-checkpoint stride, infix bloom
//! parameters, and optimizer cutoff.

use std::path::{Path, PathBuf};

/// Every Nth keyword gets a word checkpoint (spec default: 48).
pub const DEFAULT_CHECKPOINT_STRIDE: u32 = 48;

/// Fraction of the soft RAM limit that applies while a flush is already in
/// flight (the "double-buffer" limit).
pub const DEFAULT_DOUBLE_BUFFER_FRACTION: f32 = 0.10;

/// `MAX_SEGMENTS` from the merger policy (spec §4.5).
pub const MAX_SEGMENTS: usize = 32;

/// `MAX_PROGRESSION` from the merger policy (spec §4.5).
pub const MAX_PROGRESSION: usize = 8;

/// Infix bloom filter parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InfixBloomParams {
    /// Minimum infix length that gets bloom acceleration. `0` disables
    /// infix blooms entirely.
    pub min_infix_len: u8,
    /// Maximum n-gram length indexed by the bloom (spec uses 2-gram and
    /// 4-gram blocks).
    pub max_infix_len: u8,
    /// Target false-positive rate used when sizing each checkpoint's bloom.
    pub false_positive_rate: f64,
}

impl Default for InfixBloomParams {
    fn default() -> Self {
        Self {
            min_infix_len: 0,
            max_infix_len: 4,
            false_positive_rate: 0.0001,
        }
    }
}

impl InfixBloomParams {
    /// Returns `true` if infix acceleration is enabled at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.min_infix_len > 0
    }
}

/// Index-wide configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Index directory. Holds `<name>.meta`, `<name>.ram`, `<name>.lock`,
    /// `<name>.<chunk_id>.*`.
    pub path: PathBuf,

    /// Soft RAM limit in bytes; crossing it turns the next merger decision
    /// into a flush.
    pub ram_soft_limit: u64,

    /// Fraction of `ram_soft_limit` applied while a flush is already
    /// running (spec: "double-buffer limit").
    pub double_buffer_fraction: f32,

    /// Word-checkpoint stride (keywords per checkpoint).
    pub checkpoint_stride: u32,

    /// Infix bloom parameters.
    pub infix_bloom: InfixBloomParams,

    /// Disk chunks remaining at or below this count stop progressive
    /// auto-optimize merging (spec §4.8 "auto").
    pub auto_optimize_cutoff: usize,

    /// How many sub-steps the merger/optimizer perform between checks of
    /// the stop flag and cooperative yield.
    pub yield_tick_rate: u32,

    /// Row-word offset where a row's blob-pool pointer (3 packed words) is
    /// stored, if the schema carries a variable-length attribute column.
    pub blob_word_offset: Option<usize>,
}

impl Config {
    /// Creates a configuration rooted at `path` with the spec's documented
    /// defaults.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ram_soft_limit: 64 * 1024 * 1024,
            double_buffer_fraction: DEFAULT_DOUBLE_BUFFER_FRACTION,
            checkpoint_stride: DEFAULT_CHECKPOINT_STRIDE,
            infix_bloom: InfixBloomParams::default(),
            auto_optimize_cutoff: 1,
            yield_tick_rate: 1000,
            blob_word_offset: None,
        }
    }

    /// Sets the row-word offset of the blob-pool pointer.
    #[must_use]
    pub fn blob_word_offset(mut self, offset: usize) -> Self {
        self.blob_word_offset = Some(offset);
        self
    }

    /// Sets the soft RAM limit.
    #[must_use]
    pub fn ram_soft_limit(mut self, bytes: u64) -> Self {
        self.ram_soft_limit = bytes;
        self
    }

    /// Sets the word-checkpoint stride.
    #[must_use]
    pub fn checkpoint_stride(mut self, stride: u32) -> Self {
        self.checkpoint_stride = stride;
        self
    }

    /// Sets the infix bloom parameters.
    #[must_use]
    pub fn infix_bloom(mut self, params: InfixBloomParams) -> Self {
        self.infix_bloom = params;
        self
    }

    /// Sets the auto-optimize cutoff.
    #[must_use]
    pub fn auto_optimize_cutoff(mut self, cutoff: usize) -> Self {
        self.auto_optimize_cutoff = cutoff;
        self
    }

    /// The tighter RAM limit that applies while a flush is in flight.
    #[must_use]
    pub fn double_buffer_limit(&self) -> u64 {
        ((self.ram_soft_limit as f64) * f64::from(self.double_buffer_fraction)) as u64
    }
}
