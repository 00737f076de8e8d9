//! Error types for Loupe

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::blob::BlobKey;

/// Result type for Loupe operations
pub type Result<T> = std::result::Result<T, LoupeError>;

/// Errors that can occur in Loupe
#[derive(Debug, Error)]
pub enum LoupeError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write referenced a session the store doesn't know about
    #[error("unknown session: {0}")]
    InvalidSession(Uuid),

    /// Export destination already exists
    #[error("file already exists: {0}")]
    FileAlreadyExists(PathBuf),

    /// Export destination's parent directory (or the store itself) is missing
    #[error("file doesn't exist: {0}")]
    FileDoesntExist(PathBuf),

    /// Blob key is not present in the store (e.g. already swept)
    #[error("blob not found: {0}")]
    BlobNotFound(BlobKey),

    /// Task update referenced an unknown task id
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task update arrived after the task reached a terminal state
    #[error("task already completed: {0}")]
    TaskAlreadyCompleted(Uuid),

    /// Mutation attempted on a store opened in readonly mode
    #[error("store is read-only")]
    Readonly,

    /// Export was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid store file format
    #[error("invalid store format: {0}")]
    InvalidFormat(String),

    /// Store version/schema mismatch that could not be recovered in place.
    ///
    /// Writable stores recover by resetting to an empty store instead of
    /// surfacing this; only a readonly open can fail this way.
    #[error("store migration failed: {0}")]
    MigrationFailed(String),

    /// Store file corrupted (CRC mismatch)
    #[error("store corrupted at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    Corrupted {
        /// Offset where corruption was detected
        offset: u64,
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Remote protocol packet could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Row serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors local to a single remote-protocol packet.
///
/// A decode error never invalidates packets that were already decoded and
/// never forces the consumer to drop the rest of the stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet or field extends past the available bytes
    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the length prefix or field
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Packet code is not part of the known enumeration
    #[error("unknown packet code: {0}")]
    UnknownCode(u8),

    /// Declared body length exceeds the protocol limit
    #[error("packet body length {0} exceeds limit")]
    LengthOutOfBounds(u32),

    /// A string field contained invalid UTF-8
    #[error("invalid UTF-8 in packet field")]
    InvalidUtf8,

    /// A field held a value outside its enumeration
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}
