// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Errors returned by the core allocator, block-map and audit operations.
///
/// See spec §7 for the full taxonomy and propagation policy: non-fatal
/// errors are returned to the caller, while I/O errors and invariant
/// violations drive the owning subsystem into read-only mode instead.
#[derive(Debug)]
pub enum Error {
    /// `allocate` found no free block in the slab.
    NoSpace,

    /// A reference-count adjustment was semantically invalid (decrementing
    /// FREE, or incrementing past MAXIMUM). Non-fatal.
    RefCountInvalid,

    /// A structurally invalid block-map entry was encountered.
    BadMapping,

    /// A PBN fell outside the addressable data region, or inside a slab's
    /// metadata (reference or journal) blocks.
    OutOfRange,

    /// An operation was attempted on a draining, suspended or read-only
    /// object.
    InvalidAdminState,

    /// Underlying I/O failure. Triggers a read-only transition in the
    /// owning subsystem.
    Io(std::io::Error),

    /// On-disk magic or version mismatch while loading a persisted
    /// structure.
    CorruptComponent,

    /// An entry carried an operation code this build does not know about.
    /// Triggers a read-only transition, per spec §7.
    NotImplemented,

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpace => write!(f, "no free block available"),
            Self::RefCountInvalid => write!(f, "reference count operation was invalid"),
            Self::BadMapping => write!(f, "structurally invalid block-map entry"),
            Self::OutOfRange => write!(f, "PBN outside the addressable region"),
            Self::InvalidAdminState => write!(f, "operation not permitted in current admin state"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CorruptComponent => write!(f, "on-disk magic/version mismatch"),
            Self::NotImplemented => write!(f, "unknown operation code"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
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
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
