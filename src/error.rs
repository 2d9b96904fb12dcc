// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the RT index core.
#[derive(Debug)]
pub enum Error {
    /// I/O error.
    Io(std::io::Error),

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),

    /// `.meta` or `.ram` magic/version did not match what this build can
    /// read (current version, minimum readable version).
    InvalidVersion(u32),

    /// Stored checksum did not match the recomputed one.
    InvalidChecksum,

    /// A doc id collided with an already-alive row on insert.
    DuplicateDocId(i64),

    /// Attach/replace touched a schema that doesn't match the index.
    SchemaMismatch,

    /// A wildcard or infix query could not be compiled.
    BadWildcard(String),

    /// A keyword exceeded the maximum encodable length.
    KeywordTooLong(usize),

    /// A hit's field index does not fit in the posting list's field mask
    /// (which covers fields `0..64`).
    FieldIndexOutOfRange(u8),

    /// Split-by-filter left some alive rows unassigned to either half; the
    /// split is aborted and nothing changes.
    IncompleteSplit {
        /// Doc ids the filter failed to route to either resulting chunk.
        unassigned: Vec<i64>,
    },

    /// A background job observed the stop flag and gave up cleanly.
    Interrupted,

    /// Some required segments/chunks could not be recovered from disk.
    Unrecoverable,

    /// An unrecoverable persistence failure (e.g. `.meta.new` rename
    /// failed). The durability contract requires the caller to abort the
    /// process; this core only reports it.
    Fatal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RtIndexError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        match value {
            EncodeError::KeywordTooLong(len) => Self::KeywordTooLong(len),
            other => Self::Encode(other),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// RT index result.
pub type Result<T> = std::result::Result<T, Error>;
