//! Retention: the sweep engine
//!
//! Sweeps keep the store under its configured footprint. A pass first drops
//! records past the age cutoff, then, if the approximate aggregate size
//! still exceeds the budget, evicts the oldest records until only the
//! newest `floor(n * retain_ratio) + 1` remain. Deletion cascades: a
//! message's metadata and a task's sub-records go with the parent row, and
//! blobs left unreachable are physically removed in the same pass.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use tracing::{debug, info};
use uuid::Uuid;

use super::{EventStore, State, Tables};
use crate::blob::BlobKey;
use crate::events::{Change, RecordRef};
use crate::model::{Message, MessageId};
use crate::Result;

impl EventStore {
    /// Run a retention pass now.
    ///
    /// Automatic sweeps are throttled by `sweep_interval_secs`; call this
    /// directly for a deterministic pass. The most recently written record
    /// is always retained, even if the store remains over budget.
    ///
    /// # Errors
    ///
    /// Returns error if the store is readonly or the log rewrite fails; a
    /// failure against a well-formed store indicates corruption
    pub fn sweep(&self) -> Result<()> {
        self.check_writable()?;

        // An in-flight export holds a point-in-time snapshot and reads
        // blob bytes as it copies; never pull data out from under it.
        if self.exports_in_flight.load(Ordering::Acquire) > 0 {
            debug!("Sweep skipped: export in flight");
            return Ok(());
        }

        let mut state = self.lock_state();
        let now = self.config.clock.now_ns();
        state.last_sweep_at = now;

        let mut changes = Vec::new();

        // Age cutoff first, regardless of the size budget
        let max_age_ns = self.config.max_age_secs.saturating_mul(1_000_000_000);
        let cutoff = now.saturating_sub(max_age_ns);
        let expired = remove_where(&mut state, |m| m.created_at < cutoff);
        if !expired.is_empty() {
            debug!("Sweep expired {} records past the age cutoff", expired.len());
        }
        changes.extend(expired);

        // Size budget
        let approx = state.tables.approx_size(self.blobs.total_size());
        if approx > self.config.size_limit {
            let n = state.tables.messages.len();
            let keep = (n as f64 * self.config.retain_ratio) as usize + 1;
            if keep < n {
                let doomed = oldest_message_ids(&state.tables, n - keep);
                let trimmed = remove_where(&mut state, |m| doomed.contains(&m.id));
                info!(
                    "Sweep trimmed {} records over the size budget ({} retained)",
                    trimmed.len(),
                    keep
                );
                changes.extend(trimmed);
            }
        }

        if changes.is_empty() {
            return Ok(());
        }

        // Blob liveness is derived from the surviving rows, not reference
        // counts; unreachable payloads are removed in the same pass.
        let live = reachable_blob_keys(&state.tables);
        self.blobs.retain_keys(&live);

        self.rewrite_log(&mut state)?;
        drop(state);

        self.notify(&changes);
        Ok(())
    }
}

/// Row ids of the `count` oldest messages by `(created_at, id)`.
fn oldest_message_ids(tables: &Tables, count: usize) -> HashSet<MessageId> {
    let mut order: Vec<(u64, MessageId)> = tables
        .messages
        .iter()
        .map(|m| (m.created_at, m.id))
        .collect();
    order.sort_unstable();
    order.into_iter().take(count).map(|(_, id)| id).collect()
}

/// Remove every message matching the predicate, cascading to the backing
/// network task of each removed task-backed message. The message's metadata
/// and the task's sub-records are owned by their rows, so they go
/// atomically with them.
pub(crate) fn remove_where(
    state: &mut State,
    predicate: impl Fn(&Message) -> bool,
) -> Vec<Change> {
    let doomed_tasks: HashSet<Uuid> = state
        .tables
        .messages
        .iter()
        .filter(|m| predicate(m))
        .filter_map(|m| m.task_id)
        .collect();

    let mut changes = Vec::new();
    state.tables.messages.retain(|m| {
        if predicate(m) {
            changes.push(Change::deleted(RecordRef::Message(m.id)));
            false
        } else {
            true
        }
    });
    state.tables.tasks.retain(|t| {
        if doomed_tasks.contains(&t.id) {
            changes.push(Change::deleted(RecordRef::Task(t.id)));
            false
        } else {
            true
        }
    });
    state.tables.rebuild_task_index();

    changes
}

/// Blob keys referenced by any surviving task.
pub(crate) fn reachable_blob_keys(tables: &Tables) -> HashSet<BlobKey> {
    tables
        .tasks
        .iter()
        .flat_map(|t| t.blob_refs().copied())
        .collect()
}
