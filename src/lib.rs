//! Loupe - Structured diagnostic event store
//!
//! Persistently stores log messages, network-task lifecycles, and their
//! payload blobs; retires old data under a size budget; produces filtered,
//! standalone snapshots; and frames store events for near-real-time
//! mirroring to a remote observer.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_errors_doc,
    clippy::multiple_crate_versions
)]

pub mod blob;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod model;
pub mod remote;
pub mod storage;
pub mod store;

pub use blob::{BlobHandle, BlobKey, BlobStore};
pub use clock::{Clock, ManualClock};
pub use config::{OpenOptions, StoreConfig};
pub use error::{DecodeError, LoupeError, Result};
pub use events::{Change, ChangeKind, RecordRef, StoreEvent};
pub use filter::{Field, MessageQuery, Order, Predicate, TaskQuery};
pub use model::{Level, Message, NetworkTask, Session, SessionInfo};
pub use storage::ArchiveReader;
pub use store::{
    CancelToken, DocumentKind, EventStore, ExportOptions, MessageDraft, StoreInfo, TaskOutcome,
};
