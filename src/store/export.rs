//! The export/copy engine
//!
//! An export materializes a filtered, standalone copy of the store: a fresh
//! identity, rows passing the filter, and every referenced blob re-resolved
//! into the destination (which deduplicates independently). The source view
//! is point-in-time: concurrent writes after the snapshot is taken are not
//! visible in the copy.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::{make_header, EventStore, Tables};
use crate::blob::BlobStore;
use crate::events::SessionStarted;
use crate::filter::Predicate;
use crate::storage::{self, FrameKind, LogWriter, BLOBS_DIRNAME, FLAG_ARCHIVE, LOG_FILENAME};
use crate::{LoupeError, Result};

/// Records copied between cancellation checks
const EXPORT_BATCH: usize = 64;

/// The on-disk shape of an export destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentKind {
    /// Single immutable file with all blob bytes embedded
    #[default]
    Archive,
    /// Directory-based store, still mutable and appendable
    Package,
}

/// Cooperative cancellation flag for long-running exports.
///
/// The engine checks the flag between record batches; on cancellation the
/// partially written destination is removed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Filter and target options for an export
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Optional predicate over messages; composes with `sessions` by AND
    pub predicate: Option<Predicate>,
    /// Optional session restriction; `None` means no constraint
    pub sessions: Option<HashSet<Uuid>>,
    /// Destination document kind
    pub kind: DocumentKind,
    /// Cooperative cancellation flag
    pub cancel: Option<CancelToken>,
}

/// Keeps the sweep engine out of the source store for the lifetime of an
/// export.
struct ExportGuard<'a>(&'a AtomicUsize);

impl<'a> ExportGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EventStore {
    /// Copy records matching the filter into a new store at `destination`.
    ///
    /// The destination receives a freshly generated store identity, and its
    /// aggregate counters derive from the copied set alone.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::FileAlreadyExists`] if the destination exists
    /// and [`LoupeError::FileDoesntExist`] if its parent directory is
    /// missing, both before any byte is written;
    /// [`LoupeError::Cancelled`] if cancelled (the partial destination is
    /// removed first)
    pub fn export(&self, destination: &Path, options: ExportOptions) -> Result<()> {
        // Preflight, before any side effect
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(LoupeError::FileDoesntExist(parent.to_path_buf()));
            }
        }
        if destination.exists() {
            return Err(LoupeError::FileAlreadyExists(destination.to_path_buf()));
        }

        let _guard = ExportGuard::enter(&self.exports_in_flight);

        // Point-in-time view: later writes to the source are invisible here
        let snapshot = self.lock_state().tables.clone();
        let filtered = filter_snapshot(snapshot, &options);

        let result = match options.kind {
            DocumentKind::Package => self.write_package(destination, &filtered, &options),
            DocumentKind::Archive => self.write_archive(destination, &filtered, &options),
        };

        match result {
            Ok(()) => {
                info!(
                    "Exported {} messages, {} tasks to {}",
                    filtered.messages.len(),
                    filtered.tasks.len(),
                    destination.display()
                );
                Ok(())
            }
            Err(e) => {
                remove_partial(destination);
                Err(e)
            }
        }
    }

    fn write_package(
        &self,
        destination: &Path,
        tables: &Tables,
        options: &ExportOptions,
    ) -> Result<()> {
        std::fs::create_dir(destination)?;

        let dest_blobs = BlobStore::new(
            Some(destination.join(BLOBS_DIRNAME)),
            self.config.inline_limit,
            self.config.blob_compression_enabled,
        )?;
        let header = make_header(Uuid::new_v4(), self.config.clock.now_ns(), &self.config);
        let mut writer = LogWriter::create(&destination.join(LOG_FILENAME), header, false)?;

        self.copy_rows(&mut writer, tables, &dest_blobs, false, options)?;
        writer.flush()?;
        Ok(())
    }

    fn write_archive(
        &self,
        destination: &Path,
        tables: &Tables,
        options: &ExportOptions,
    ) -> Result<()> {
        let dest_blobs = BlobStore::new(
            None,
            self.config.inline_limit,
            self.config.blob_compression_enabled,
        )?;
        let mut header = make_header(Uuid::new_v4(), self.config.clock.now_ns(), &self.config);
        header.set_flag(FLAG_ARCHIVE);
        let mut writer = LogWriter::create(destination, header, false)?;

        self.copy_rows(&mut writer, tables, &dest_blobs, true, options)?;
        writer.finalize_archive()?;
        Ok(())
    }

    /// Copy the filtered rows, re-resolving every blob reference through
    /// the source blob store into the destination's.
    fn copy_rows(
        &self,
        writer: &mut LogWriter,
        tables: &Tables,
        dest_blobs: &BlobStore,
        embed_blobs: bool,
        options: &ExportOptions,
    ) -> Result<()> {
        for session in &tables.sessions {
            let body = serde_json::to_vec(&SessionStarted {
                session: session.clone(),
            })?;
            writer.append_frame(FrameKind::Session, &body)?;
        }

        let mut processed = 0usize;
        for task in &tables.tasks {
            check_cancelled(options, &mut processed)?;

            for key in task.blob_refs() {
                let bytes = self.blobs.retrieve(key)?;
                let handle = dest_blobs.store(&bytes)?;
                if handle.newly_stored {
                    let record = dest_blobs
                        .record(&handle.key)
                        .ok_or(LoupeError::BlobNotFound(handle.key))?;
                    let data = if embed_blobs || record.inline {
                        Some(dest_blobs.stored_bytes(&handle.key)?)
                    } else {
                        None
                    };
                    let frame = storage::encode_blob_frame(&record, data.as_deref())?;
                    writer.append_frame(FrameKind::Blob, &frame)?;
                }
            }

            let kind = if task.state.is_terminal() {
                FrameKind::TaskCompleted
            } else {
                FrameKind::TaskBegan
            };
            writer.append_frame(kind, &serde_json::to_vec(task)?)?;
        }

        for message in &tables.messages {
            check_cancelled(options, &mut processed)?;
            writer.append_frame(FrameKind::Message, &serde_json::to_vec(message)?)?;
        }

        Ok(())
    }
}

fn check_cancelled(options: &ExportOptions, processed: &mut usize) -> Result<()> {
    *processed += 1;
    if *processed % EXPORT_BATCH == 0 {
        if let Some(cancel) = &options.cancel {
            if cancel.is_cancelled() {
                return Err(LoupeError::Cancelled);
            }
        }
    }
    Ok(())
}

/// Apply the export filter to a snapshot. The predicate and session set
/// compose by intersection; either may be absent.
fn filter_snapshot(mut tables: Tables, options: &ExportOptions) -> Tables {
    if let Some(sessions) = &options.sessions {
        tables.sessions.retain(|s| sessions.contains(&s.id));
    }
    let session_ids: HashSet<Uuid> = tables.sessions.iter().map(|s| s.id).collect();

    let task_lookup = std::mem::take(&mut tables.task_index);
    let tasks = std::mem::take(&mut tables.tasks);

    tables.messages.retain(|m| {
        if !session_ids.contains(&m.session_id) {
            return false;
        }
        match &options.predicate {
            Some(predicate) => {
                let task = m
                    .task_id
                    .and_then(|id| task_lookup.get(&id))
                    .map(|&i| &tasks[i]);
                predicate.matches(m, task)
            }
            None => true,
        }
    });

    let kept_tasks: HashSet<Uuid> = tables
        .messages
        .iter()
        .filter_map(|m| m.task_id)
        .collect();
    tables.tasks = tasks
        .into_iter()
        .filter(|t| kept_tasks.contains(&t.id))
        .collect();
    tables.rebuild_task_index();

    tables
}

fn remove_partial(destination: &Path) {
    let result = if destination.is_dir() {
        std::fs::remove_dir_all(destination)
    } else if destination.is_file() {
        std::fs::remove_file(destination)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!(
            "Failed to clean up partial export at {}: {e}",
            destination.display()
        );
    }
}
