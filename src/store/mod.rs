//! The event store
//!
//! One store instance owns one on-disk package (or a readonly archive) and
//! serializes every mutation through a single writer lock. Reads clone a
//! consistent view of the row tables, so queries and export snapshots never
//! observe a partially applied multi-row write.

mod export;
mod sweep;

pub use export::{CancelToken, DocumentKind, ExportOptions};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::{OpenOptions, StoreConfig};
use crate::events::{
    Change, MessageStored, NetworkTaskCompleted, NetworkTaskCreated, NetworkTaskProgressUpdated,
    RecordRef, SessionStarted, StoreEvent,
};
use crate::filter::{MessageQuery, Order, TaskQuery};
use crate::model::{
    Level, Message, MessageId, NetworkTask, Session, SessionInfo, TaskError, TaskKind, TaskRequest,
    TaskResponse, TaskState, TransactionMetrics,
};
use crate::storage::{
    self, ArchiveReader, FileHeader, FrameKind, LogReader, LogWriter, BLOBS_DIRNAME, FILE_VERSION,
    FLAG_COMPRESSED_BLOBS, HEADER_SIZE, LOG_FILENAME,
};
use crate::{LoupeError, Result};

/// Fixed batch size used by [`EventStore::messages_batched`].
///
/// A tunable constant for incremental UI-style consumption, not a
/// correctness property.
pub const QUERY_BATCH_SIZE: usize = 100;

/// Approximate on-disk footprint of one message row
pub(crate) const MESSAGE_ROW_ESTIMATE: u64 = 512;

/// Approximate on-disk footprint of one task row with sub-records
pub(crate) const TASK_ROW_ESTIMATE: u64 = 2048;

/// Aggregate store statistics, recomputed from the live row set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    /// Store identity
    pub store_id: Uuid,
    /// On-disk format version
    pub version: u32,
    /// Store creation time in nanoseconds since the Unix epoch
    pub created_at: u64,
    /// Number of plain messages (task-backed messages excluded)
    pub message_count: usize,
    /// Number of network tasks
    pub task_count: usize,
    /// Number of stored blobs
    pub blob_count: usize,
    /// Total stored blob size in bytes
    pub blobs_size: u64,
    /// Approximate total store size in bytes
    pub total_size: u64,
}

/// Draft of a message to store
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    /// Severity
    pub level: Level,
    /// Subsystem label
    pub label: String,
    /// Message text
    pub text: String,
    /// Ordered key/value metadata, attached at creation only
    pub metadata: Vec<(String, String)>,
    /// Source file
    pub file: String,
    /// Source function
    pub function: String,
    /// Source line
    pub line: u32,
    /// Owning session; `None` uses the current session
    pub session_id: Option<Uuid>,
    /// Creation time override; `None` uses the store clock
    pub created_at: Option<u64>,
}

impl MessageDraft {
    /// Draft with the given severity, label, and text.
    #[must_use]
    pub fn new(level: Level, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            label: label.into(),
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Terminal outcome of a locally tracked network task
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    /// Response, if one arrived
    pub response: Option<TaskResponse>,
    /// Error details; presence marks the task failed
    pub error: Option<TaskError>,
    /// Raw request body bytes to store
    pub request_body: Option<Vec<u8>>,
    /// Raw response body bytes to store
    pub response_body: Option<Vec<u8>>,
    /// Per-transaction metrics
    pub metrics: Vec<TransactionMetrics>,
    /// Total duration in nanoseconds
    pub duration_ns: u64,
}

/// Handle returned by [`EventStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn Fn(&Change) + Send + Sync>;

/// In-memory row tables. Cloning produces the point-in-time view used by
/// queries and exports.
#[derive(Default, Clone)]
pub(crate) struct Tables {
    pub sessions: Vec<Session>,
    /// Messages ordered by row id
    pub messages: Vec<Message>,
    pub tasks: Vec<NetworkTask>,
    pub task_index: HashMap<Uuid, usize>,
}

impl Tables {
    pub(crate) fn session_exists(&self, id: Uuid) -> bool {
        self.sessions.iter().any(|s| s.id == id)
    }

    pub(crate) fn message_index(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by_key(&id, |m| m.id).ok()
    }

    pub(crate) fn task(&self, id: Uuid) -> Option<&NetworkTask> {
        self.task_index.get(&id).map(|&i| &self.tasks[i])
    }

    pub(crate) fn rebuild_task_index(&mut self) {
        self.task_index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
    }

    pub(crate) fn approx_size(&self, blobs_size: u64) -> u64 {
        self.messages.len() as u64 * MESSAGE_ROW_ESTIMATE
            + self.tasks.len() as u64 * TASK_ROW_ESTIMATE
            + blobs_size
    }
}

pub(crate) struct State {
    pub tables: Tables,
    pub writer: Option<LogWriter>,
    pub current_session: Option<Uuid>,
    pub next_message_id: MessageId,
    pub last_sweep_at: u64,
}

/// Persistently stores log messages, network tasks, and payload blobs.
///
/// Stores are explicit values: create as many independent instances as
/// needed (the export engine and the tests rely on this).
pub struct EventStore {
    path: Option<PathBuf>,
    options: OpenOptions,
    config: StoreConfig,
    store_id: Uuid,
    created_at: u64,
    blobs: BlobStore,
    state: Mutex<State>,
    observers: RwLock<Vec<(u64, Observer)>>,
    next_observer_id: AtomicU64,
    pub(crate) exports_in_flight: AtomicUsize,
}

impl EventStore {
    /// Open a store at `path`.
    ///
    /// A directory (or a missing path with the `create` option) opens as a
    /// mutable package; an existing file opens as a readonly archive.
    ///
    /// A package whose log cannot be read (format change, corrupt header)
    /// is reset to an empty store rather than failing to open: losing old
    /// diagnostics is preferred over refusing to record new ones.
    ///
    /// # Errors
    ///
    /// Returns error if the path is absent without `create`, an archive is
    /// opened writable, or I/O fails
    pub fn open(path: &Path, options: OpenOptions, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        if path.is_file() {
            return Self::open_archive(path, options, config);
        }
        Self::open_package(path, options, config)
    }

    /// Open a store that keeps everything in memory and writes nothing to
    /// disk. Blobs are always stored inline.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let blobs = BlobStore::new(None, config.inline_limit, config.blob_compression_enabled)?;
        let now = config.clock.now_ns();

        let store = Self {
            path: None,
            options: OpenOptions::default(),
            store_id: Uuid::new_v4(),
            created_at: now,
            blobs,
            state: Mutex::new(State {
                tables: Tables::default(),
                writer: None,
                current_session: None,
                next_message_id: 1,
                last_sweep_at: now,
            }),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            exports_in_flight: AtomicUsize::new(0),
            config,
        };
        store.auto_start_session()?;
        Ok(store)
    }

    fn open_package(path: &Path, options: OpenOptions, config: StoreConfig) -> Result<Self> {
        if !path.exists() {
            if !options.create {
                return Err(LoupeError::FileDoesntExist(path.to_path_buf()));
            }
            std::fs::create_dir_all(path)?;
        }

        let log_path = path.join(LOG_FILENAME);
        let blobs_dir = path.join(BLOBS_DIRNAME);

        let mut tables = Tables::default();
        let mut next_message_id: MessageId = 1;
        let store_id;
        let created_at;
        let writer;

        let clock = config.clock.clone();
        let blobs;

        if log_path.exists() {
            match LogReader::read_all(&log_path) {
                Ok(replayed) => {
                    blobs = BlobStore::new(
                        Some(blobs_dir),
                        config.inline_limit,
                        config.blob_compression_enabled,
                    )?;
                    store_id = Uuid::from_bytes(replayed.header.store_id);
                    created_at = replayed.header.created_at;
                    for frame in &replayed.frames {
                        if let Err(e) =
                            replay_frame(&mut tables, &blobs, &mut next_message_id, frame)
                        {
                            warn!("Skipping unreadable frame: {e}");
                        }
                    }
                    tables.rebuild_task_index();
                    writer = if options.readonly {
                        None
                    } else {
                        Some(LogWriter::open_append(
                            &log_path,
                            replayed.header,
                            replayed.valid_len,
                            options.synchronous,
                        )?)
                    };
                }
                Err(e) => {
                    // Migration/recovery: reset contents, keep the identity
                    // if the old header was still readable.
                    if options.readonly {
                        return Err(LoupeError::MigrationFailed(e.to_string()));
                    }
                    warn!("Store unreadable ({e}), resetting to an empty store");
                    let salvaged = salvage_store_id(&log_path);
                    std::fs::remove_file(&log_path)?;
                    if blobs_dir.exists() {
                        std::fs::remove_dir_all(&blobs_dir)?;
                    }
                    blobs = BlobStore::new(
                        Some(blobs_dir),
                        config.inline_limit,
                        config.blob_compression_enabled,
                    )?;
                    store_id = salvaged.unwrap_or_else(Uuid::new_v4);
                    created_at = clock.now_ns();
                    writer = Some(LogWriter::create(
                        &log_path,
                        make_header(store_id, created_at, &config),
                        options.synchronous,
                    )?);
                }
            }
        } else {
            if options.readonly || !options.create {
                return Err(LoupeError::FileDoesntExist(log_path));
            }
            blobs = BlobStore::new(
                Some(blobs_dir),
                config.inline_limit,
                config.blob_compression_enabled,
            )?;
            store_id = Uuid::new_v4();
            created_at = clock.now_ns();
            writer = Some(LogWriter::create(
                &log_path,
                make_header(store_id, created_at, &config),
                options.synchronous,
            )?);
        }

        let current_session = latest_session(&tables);
        let now = clock.now_ns();

        let store = Self {
            path: Some(path.to_path_buf()),
            options,
            store_id,
            created_at,
            blobs,
            state: Mutex::new(State {
                tables,
                writer,
                current_session,
                next_message_id,
                last_sweep_at: now,
            }),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            exports_in_flight: AtomicUsize::new(0),
            config,
        };

        if !options.readonly {
            store.auto_start_session()?;
        }

        let (message_count, task_count) = {
            let state = store.lock_state();
            (state.tables.messages.len(), state.tables.tasks.len())
        };
        info!(
            "Opened store {} at {} ({message_count} messages, {task_count} tasks)",
            store.store_id,
            path.display(),
        );
        Ok(store)
    }

    fn open_archive(path: &Path, options: OpenOptions, config: StoreConfig) -> Result<Self> {
        if !options.readonly {
            return Err(LoupeError::InvalidFormat(
                "archives are immutable; open with the readonly option".to_string(),
            ));
        }

        let archive = ArchiveReader::open(path)?;
        let header = *archive.header();

        let blobs = BlobStore::new(None, config.inline_limit, config.blob_compression_enabled)?;
        let mut tables = Tables::default();
        let mut next_message_id: MessageId = 1;

        for frame in archive.frames() {
            let (kind, body) = frame?;
            let frame = storage::Frame {
                kind,
                body: body.to_vec(),
            };
            replay_frame(&mut tables, &blobs, &mut next_message_id, &frame)?;
        }
        tables.rebuild_task_index();

        let current_session = latest_session(&tables);
        let now = config.clock.now_ns();

        Ok(Self {
            path: Some(path.to_path_buf()),
            options,
            store_id: Uuid::from_bytes(header.store_id),
            created_at: header.created_at,
            blobs,
            state: Mutex::new(State {
                tables,
                writer: None,
                current_session,
                next_message_id,
                last_sweep_at: now,
            }),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            exports_in_flight: AtomicUsize::new(0),
            config,
        })
    }

    // MARK: Accessors

    /// Store identity; distinct for every independent store instance.
    #[must_use]
    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    /// Path the store was opened at, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Options the store was opened with.
    #[must_use]
    pub fn options(&self) -> OpenOptions {
        self.options
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The blob store backing this event store.
    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // MARK: Sessions

    /// Record a new session and make it current.
    ///
    /// The previous session's data remains valid; sessions never close.
    ///
    /// # Errors
    ///
    /// Returns error if the store is readonly or the write fails
    pub fn start_session(&self, session: Session) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let change = if state.tables.session_exists(session.id) {
            None
        } else {
            append_row_frame(
                &mut state.writer,
                FrameKind::Session,
                &SessionStarted {
                    session: session.clone(),
                },
            )?;
            let id = session.id;
            state.tables.sessions.push(session.clone());
            Some(Change::inserted(RecordRef::Session(id)))
        };
        state.current_session = Some(session.id);
        drop(state);

        if let Some(change) = change {
            self.notify(&[change]);
        }
        Ok(())
    }

    /// The current session id, used by "current session only" filters.
    #[must_use]
    pub fn current_session(&self) -> Option<Uuid> {
        self.lock_state().current_session
    }

    /// All recorded sessions, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions = self.lock_state().tables.sessions.clone();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    fn auto_start_session(&self) -> Result<()> {
        if !self.config.auto_start_session {
            return Ok(());
        }
        let session = Session::new(self.config.clock.now_ns(), SessionInfo::current());
        self.start_session(session)
    }

    // MARK: Writing

    /// Store a log message.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::InvalidSession`] if the draft references an
    /// unknown session (or no session is active), [`LoupeError::Readonly`]
    /// on a readonly store
    pub fn store_message(&self, draft: MessageDraft) -> Result<MessageId> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let session_id = self.resolve_session(&state, draft.session_id)?;
        let event = MessageStored {
            created_at: draft
                .created_at
                .unwrap_or_else(|| self.config.clock.now_ns()),
            level: draft.level,
            label: draft.label,
            text: draft.text,
            metadata: draft.metadata,
            session_id,
            file: draft.file,
            function: draft.function,
            line: draft.line,
        };

        let (id, changes) = self.apply_message(&mut state, &event, None)?;
        drop(state);

        self.notify(&changes);
        self.maybe_auto_sweep();
        Ok(id)
    }

    /// Begin tracking a network task in the pending state.
    ///
    /// Also stores the task's backing message (label "network") so unified
    /// message views include in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::InvalidSession`] if no session is active
    pub fn begin_task(&self, task_id: Uuid, kind: TaskKind, request: TaskRequest) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let session_id = self.resolve_session(&state, None)?;
        let event = NetworkTaskCreated {
            task_id,
            kind,
            created_at: self.config.clock.now_ns(),
            request,
            session_id,
        };

        let changes = self.apply_task_created(&mut state, &event)?;
        drop(state);

        self.notify(&changes);
        self.maybe_auto_sweep();
        Ok(())
    }

    /// Update transfer progress for an in-flight task.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::TaskNotFound`] for an unknown id and
    /// [`LoupeError::TaskAlreadyCompleted`] after a terminal state
    pub fn update_task_progress(&self, task_id: Uuid, completed: i64, total: i64) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let event = NetworkTaskProgressUpdated {
            task_id,
            completed,
            total,
        };
        let changes = self.apply_task_progress(&mut state, &event)?;
        drop(state);

        self.notify(&changes);
        Ok(())
    }

    /// Complete a task with a terminal success or failure state.
    ///
    /// Body payloads are placed in the blob store before the task row
    /// becomes durable, so a stored task never references unresolvable
    /// blob keys.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::TaskNotFound`] for an unknown id and
    /// [`LoupeError::TaskAlreadyCompleted`] if already terminal
    pub fn complete_task(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let task = state
            .tables
            .task(task_id)
            .ok_or(LoupeError::TaskNotFound(task_id))?;
        if task.state.is_terminal() {
            return Err(LoupeError::TaskAlreadyCompleted(task_id));
        }

        let event = NetworkTaskCompleted {
            task_id,
            kind: task.kind,
            created_at: task.created_at,
            session_id: task.session_id,
            duration_ns: outcome.duration_ns,
            request: task.request.clone(),
            response: outcome.response,
            error: outcome.error,
            request_body: outcome.request_body,
            response_body: outcome.response_body,
            metrics: outcome.metrics,
        };

        let changes = self.apply_task_completed(&mut state, &event)?;
        drop(state);

        self.notify(&changes);
        self.maybe_auto_sweep();
        Ok(())
    }

    /// Apply an event produced elsewhere, e.g. decoded from the remote
    /// sync protocol.
    ///
    /// The event's session must already be known to this store (start it
    /// from the peer's handshake first).
    ///
    /// # Errors
    ///
    /// Returns the same errors as the corresponding direct write
    pub fn handle(&self, event: StoreEvent) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let changes = match &event {
            StoreEvent::MessageStored(event) => {
                if !state.tables.session_exists(event.session_id) {
                    return Err(LoupeError::InvalidSession(event.session_id));
                }
                self.apply_message(&mut state, event, None)?.1
            }
            StoreEvent::NetworkTaskCreated(event) => self.apply_task_created(&mut state, event)?,
            StoreEvent::NetworkTaskProgressUpdated(event) => {
                self.apply_task_progress(&mut state, event)?
            }
            StoreEvent::NetworkTaskCompleted(event) => {
                // A mirror may see a completion without having seen the
                // creation; materialize the pending row first.
                if state.tables.task(event.task_id).is_none() {
                    let created = NetworkTaskCreated {
                        task_id: event.task_id,
                        kind: event.kind,
                        created_at: event.created_at,
                        request: event.request.clone(),
                        session_id: event.session_id,
                    };
                    let mut changes = self.apply_task_created(&mut state, &created)?;
                    changes.extend(self.apply_task_completed(&mut state, event)?);
                    changes
                } else {
                    self.apply_task_completed(&mut state, event)?
                }
            }
        };
        drop(state);

        self.notify(&changes);
        self.maybe_auto_sweep();
        Ok(())
    }

    fn apply_message(
        &self,
        state: &mut State,
        event: &MessageStored,
        task_id: Option<Uuid>,
    ) -> Result<(MessageId, Vec<Change>)> {
        if !state.tables.session_exists(event.session_id) {
            return Err(LoupeError::InvalidSession(event.session_id));
        }

        let id = state.next_message_id;
        let message = Message {
            id,
            created_at: event.created_at,
            level: event.level,
            label: event.label.clone(),
            session_id: event.session_id,
            text: event.text.clone(),
            metadata: event.metadata.clone(),
            file: event.file.clone(),
            function: event.function.clone(),
            line: event.line,
            task_id,
        };

        append_row_frame(&mut state.writer, FrameKind::Message, &message)?;
        state.next_message_id += 1;
        state.tables.messages.push(message);

        Ok((id, vec![Change::inserted(RecordRef::Message(id))]))
    }

    fn apply_task_created(
        &self,
        state: &mut State,
        event: &NetworkTaskCreated,
    ) -> Result<Vec<Change>> {
        if !state.tables.session_exists(event.session_id) {
            return Err(LoupeError::InvalidSession(event.session_id));
        }
        if state.tables.task(event.task_id).is_some() {
            // Defensive: a duplicate create is a no-op
            return Ok(Vec::new());
        }

        let backing = MessageStored {
            created_at: event.created_at,
            level: Level::Debug,
            label: "network".to_string(),
            text: event.request.url.clone(),
            metadata: Vec::new(),
            session_id: event.session_id,
            file: String::new(),
            function: String::new(),
            line: 0,
        };
        let (message_id, mut changes) =
            self.apply_message(state, &backing, Some(event.task_id))?;

        let task = NetworkTask {
            id: event.task_id,
            session_id: event.session_id,
            kind: event.kind,
            state: TaskState::Pending,
            created_at: event.created_at,
            duration_ns: 0,
            url: event.request.url.clone(),
            http_method: event.request.http_method.clone(),
            request: event.request.clone(),
            response: None,
            metrics: Vec::new(),
            progress: None,
            error: None,
            request_body_size: -1,
            response_body_size: -1,
            request_body: None,
            response_body: None,
            message_id,
        };

        append_row_frame(&mut state.writer, FrameKind::TaskBegan, &task)?;
        state.tables.tasks.push(task);
        let index = state.tables.tasks.len() - 1;
        state.tables.task_index.insert(event.task_id, index);

        changes.push(Change::inserted(RecordRef::Task(event.task_id)));
        Ok(changes)
    }

    fn apply_task_progress(
        &self,
        state: &mut State,
        event: &NetworkTaskProgressUpdated,
    ) -> Result<Vec<Change>> {
        let index = *state
            .tables
            .task_index
            .get(&event.task_id)
            .ok_or(LoupeError::TaskNotFound(event.task_id))?;
        if state.tables.tasks[index].state.is_terminal() {
            return Err(LoupeError::TaskAlreadyCompleted(event.task_id));
        }

        append_row_frame(&mut state.writer, FrameKind::TaskProgress, event)?;
        state.tables.tasks[index].progress = Some(crate::model::TaskProgress {
            completed: event.completed,
            total: event.total,
        });

        Ok(vec![Change::updated(RecordRef::Task(event.task_id))])
    }

    fn apply_task_completed(
        &self,
        state: &mut State,
        event: &NetworkTaskCompleted,
    ) -> Result<Vec<Change>> {
        let index = *state
            .tables
            .task_index
            .get(&event.task_id)
            .ok_or(LoupeError::TaskNotFound(event.task_id))?;
        if state.tables.tasks[index].state.is_terminal() {
            return Err(LoupeError::TaskAlreadyCompleted(event.task_id));
        }

        // Blob bytes are placed (and made durable) before the task row that
        // references them.
        let request_blob = self.place_body(state, event.request_body.as_deref())?;
        let response_blob = self.place_body(state, event.response_body.as_deref())?;

        let is_failure = event.is_failure();
        let task = &mut state.tables.tasks[index];
        task.state = if is_failure {
            TaskState::Failure
        } else {
            TaskState::Success
        };
        task.duration_ns = event.duration_ns;
        task.url = event.request.url.clone();
        task.http_method = event.request.http_method.clone();
        task.request = event.request.clone();
        task.response = event.response.clone();
        task.metrics = event.metrics.clone();
        task.progress = None;
        task.error = event.error.clone();
        task.request_body = request_blob;
        task.response_body = response_blob;
        task.request_body_size = body_size(event.request_body.as_deref(), &event.metrics, true);
        task.response_body_size = body_size(event.response_body.as_deref(), &event.metrics, false);

        let task_row = task.clone();
        let message_id = task_row.message_id;
        append_row_frame(&mut state.writer, FrameKind::TaskCompleted, &task_row)?;

        let mut changes = vec![Change::updated(RecordRef::Task(event.task_id))];

        // Escalate the backing message so failed requests surface in
        // level-filtered views.
        if is_failure {
            if let Some(i) = state.tables.message_index(message_id) {
                state.tables.messages[i].level = Level::Error;
                changes.push(Change::updated(RecordRef::Message(message_id)));
            }
        }

        Ok(changes)
    }

    fn place_body(
        &self,
        state: &mut State,
        body: Option<&[u8]>,
    ) -> Result<Option<crate::blob::BlobKey>> {
        let Some(body) = body else { return Ok(None) };
        if body.is_empty() || body.len() > self.config.body_size_limit {
            return Ok(None);
        }

        let handle = self.blobs.store(body)?;
        if handle.newly_stored {
            if let Some(record) = self.blobs.record(&handle.key) {
                let data = record
                    .inline
                    .then(|| self.blobs.stored_bytes(&handle.key))
                    .transpose()?;
                let frame = storage::encode_blob_frame(&record, data.as_deref())?;
                if let Some(writer) = &mut state.writer {
                    writer.append_frame(FrameKind::Blob, &frame)?;
                }
            }
        }
        Ok(Some(handle.key))
    }

    fn resolve_session(&self, state: &State, explicit: Option<Uuid>) -> Result<Uuid> {
        match explicit {
            Some(id) => {
                if state.tables.session_exists(id) {
                    Ok(id)
                } else {
                    Err(LoupeError::InvalidSession(id))
                }
            }
            None => state
                .current_session
                .ok_or(LoupeError::InvalidSession(Uuid::nil())),
        }
    }

    // MARK: Queries

    /// Messages matching a query, ordered newest-first by default.
    #[must_use]
    pub fn messages(&self, query: &MessageQuery) -> Vec<Message> {
        let state = self.lock_state();
        let tables = &state.tables;

        let mut results: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| {
                if let Some(sessions) = &query.sessions {
                    if !sessions.contains(&m.session_id) {
                        return false;
                    }
                }
                match &query.predicate {
                    Some(predicate) => {
                        let task = m.task_id.and_then(|id| tables.task(id));
                        predicate.matches(m, task)
                    }
                    None => true,
                }
            })
            .cloned()
            .collect();
        drop(state);

        sort_messages(&mut results, query.order);
        results
    }

    /// Messages matching a query, yielded in fixed-size batches of
    /// [`QUERY_BATCH_SIZE`] to bound per-step memory for incremental
    /// consumers.
    #[must_use]
    pub fn messages_batched(&self, query: &MessageQuery) -> impl Iterator<Item = Vec<Message>> {
        let results = self.messages(query);
        let mut batches: Vec<Vec<Message>> = Vec::new();
        let mut current = Vec::with_capacity(QUERY_BATCH_SIZE.min(results.len()));
        for message in results {
            current.push(message);
            if current.len() == QUERY_BATCH_SIZE {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches.into_iter()
    }

    /// Network tasks matching a query, ordered newest-first by default.
    #[must_use]
    pub fn tasks(&self, query: &TaskQuery) -> Vec<NetworkTask> {
        let state = self.lock_state();
        let mut results: Vec<NetworkTask> = state
            .tables
            .tasks
            .iter()
            .filter(|t| match &query.sessions {
                Some(sessions) => sessions.contains(&t.session_id),
                None => true,
            })
            .cloned()
            .collect();
        drop(state);

        match query.order {
            Order::NewestFirst => results.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            Order::OldestFirst => results.sort_by_key(|t| t.created_at),
        }
        results
    }

    /// Look up a single task by id.
    #[must_use]
    pub fn task(&self, id: Uuid) -> Option<NetworkTask> {
        self.lock_state().tables.task(id).cloned()
    }

    /// Aggregate counters, recomputed from the live row set.
    #[must_use]
    pub fn info(&self) -> StoreInfo {
        let state = self.lock_state();
        let tables = &state.tables;
        let blobs_size = self.blobs.total_size();

        StoreInfo {
            store_id: self.store_id,
            version: FILE_VERSION,
            created_at: self.created_at,
            message_count: tables
                .messages
                .iter()
                .filter(|m| m.task_id.is_none())
                .count(),
            task_count: tables.tasks.len(),
            blob_count: self.blobs.len(),
            blobs_size,
            total_size: HEADER_SIZE as u64 + tables.approx_size(blobs_size),
        }
    }

    // MARK: Observers

    /// Register a change observer.
    ///
    /// Observers are called after a mutation is fully applied and the
    /// write lock released; they never see partial writes.
    pub fn subscribe(&self, observer: impl Fn(&Change) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .expect("observers lock")
            .push((id, Box::new(observer)));
        SubscriptionId(id)
    }

    /// Remove a previously registered observer.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers
            .write()
            .expect("observers lock")
            .retain(|(observer_id, _)| *observer_id != id.0);
    }

    pub(crate) fn notify(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        let observers = self.observers.read().expect("observers lock");
        for change in changes {
            for (_, observer) in observers.iter() {
                observer(change);
            }
        }
    }

    // MARK: Maintenance

    /// Remove all messages, tasks, and blobs. Sessions are removed too,
    /// except the current one.
    ///
    /// # Errors
    ///
    /// Returns error if the store is readonly or the rewrite fails
    pub fn remove_all(&self) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let current = state.current_session;
        let changes = sweep::remove_where(&mut state, |_| true);
        state.tables.sessions.retain(|s| Some(s.id) == current);

        self.blobs.retain_keys(&HashSet::new());
        self.rewrite_log(&mut state)?;
        drop(state);

        self.notify(&changes);
        Ok(())
    }

    /// Remove the given sessions and everything recorded under them.
    ///
    /// # Errors
    ///
    /// Returns error if the store is readonly or the rewrite fails
    pub fn remove_sessions(&self, session_ids: &HashSet<Uuid>) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock_state();

        let mut changes = sweep::remove_where(&mut state, |m| {
            session_ids.contains(&m.session_id)
        });
        state.tables.sessions.retain(|s| {
            if session_ids.contains(&s.id) {
                changes.push(Change::deleted(RecordRef::Session(s.id)));
                false
            } else {
                true
            }
        });
        if state
            .current_session
            .is_some_and(|id| session_ids.contains(&id))
        {
            state.current_session = None;
        }

        let live = sweep::reachable_blob_keys(&state.tables);
        self.blobs.retain_keys(&live);
        self.rewrite_log(&mut state)?;
        drop(state);

        self.notify(&changes);
        Ok(())
    }

    /// Flush buffered writes to disk.
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(writer) = &mut state.writer {
            writer.flush()?;
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.options.readonly {
            return Err(LoupeError::Readonly);
        }
        Ok(())
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store lock poisoned")
    }

    fn maybe_auto_sweep(&self) {
        let due = {
            let state = self.lock_state();
            let now = self.config.clock.now_ns();
            let interval_ns = self.config.sweep_interval_secs.saturating_mul(1_000_000_000);
            now.saturating_sub(state.last_sweep_at) > interval_ns
        };
        if due {
            if let Err(e) = self.sweep() {
                warn!("Automatic sweep failed: {e}");
            }
        }
    }

    /// Rewrite the package log compacted to the current row set.
    pub(crate) fn rewrite_log(&self, state: &mut State) -> Result<()> {
        let Some(dir) = &self.path else {
            return Ok(()); // in-memory store
        };
        if state.writer.is_none() {
            return Ok(());
        }

        let log_path = dir.join(LOG_FILENAME);
        let tmp_path = dir.join(format!("{LOG_FILENAME}.tmp"));

        // Close the current writer before swapping files
        state.writer = None;

        {
            let header = make_header(self.store_id, self.created_at, &self.config);
            let mut writer = LogWriter::create(&tmp_path, header, false)?;
            write_snapshot_frames(&mut writer, &state.tables, &self.blobs, false)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &log_path)?;

        let replayed = LogReader::read_all(&log_path)?;
        state.writer = Some(LogWriter::open_append(
            &log_path,
            replayed.header,
            replayed.valid_len,
            self.options.synchronous,
        )?);

        debug!("Compacted store log at {}", log_path.display());
        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(writer) = &mut state.writer {
                let _ = writer.flush();
            }
        }
    }
}

fn sort_messages(messages: &mut [Message], order: Order) {
    match order {
        Order::NewestFirst => messages.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        }),
        Order::OldestFirst => messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        }),
    }
}

fn body_size(body: Option<&[u8]>, metrics: &[TransactionMetrics], request: bool) -> i64 {
    if let Some(body) = body {
        return body.len() as i64;
    }
    metrics
        .iter()
        .rev()
        .find(|m| m.fetch_kind == crate::model::FetchKind::NetworkLoad)
        .map_or(-1, |m| {
            if request {
                m.request_body_bytes as i64
            } else {
                m.response_body_bytes as i64
            }
        })
}

fn latest_session(tables: &Tables) -> Option<Uuid> {
    tables
        .sessions
        .iter()
        .max_by_key(|s| s.started_at)
        .map(|s| s.id)
}

fn make_header(store_id: Uuid, created_at: u64, config: &StoreConfig) -> FileHeader {
    let mut header = FileHeader {
        store_id: *store_id.as_bytes(),
        created_at,
        ..FileHeader::default()
    };
    if config.blob_compression_enabled {
        header.set_flag(FLAG_COMPRESSED_BLOBS);
    }
    header
}

fn salvage_store_id(log_path: &Path) -> Option<Uuid> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    let mut file = std::fs::File::open(log_path).ok()?;
    std::io::Read::read_exact(&mut file, &mut header_bytes).ok()?;
    let header: FileHeader = bytemuck::pod_read_unaligned(&header_bytes);
    (header.magic == storage::FILE_MAGIC).then(|| Uuid::from_bytes(header.store_id))
}

fn append_row_frame<T: Serialize>(
    writer: &mut Option<LogWriter>,
    kind: FrameKind,
    row: &T,
) -> Result<()> {
    if let Some(writer) = writer {
        let body = serde_json::to_vec(row)?;
        writer.append_frame(kind, &body)?;
    }
    Ok(())
}

fn replay_frame(
    tables: &mut Tables,
    blobs: &BlobStore,
    next_message_id: &mut MessageId,
    frame: &storage::Frame,
) -> Result<()> {
    match frame.kind {
        FrameKind::Session => {
            let started: SessionStarted = serde_json::from_slice(&frame.body)?;
            if !tables.session_exists(started.session.id) {
                tables.sessions.push(started.session);
            }
        }
        FrameKind::Message => {
            let message: Message = serde_json::from_slice(&frame.body)?;
            *next_message_id = (*next_message_id).max(message.id + 1);
            tables.messages.push(message);
        }
        FrameKind::TaskBegan | FrameKind::TaskCompleted => {
            let task: NetworkTask = serde_json::from_slice(&frame.body)?;
            if task.state == TaskState::Failure {
                if let Some(i) = tables.message_index(task.message_id) {
                    tables.messages[i].level = Level::Error;
                }
            }
            match tables.tasks.iter().position(|t| t.id == task.id) {
                Some(i) => tables.tasks[i] = task,
                None => tables.tasks.push(task),
            }
        }
        FrameKind::TaskProgress => {
            let event: NetworkTaskProgressUpdated = serde_json::from_slice(&frame.body)?;
            if let Some(task) = tables
                .tasks
                .iter_mut()
                .find(|t| t.id == event.task_id && !t.state.is_terminal())
            {
                task.progress = Some(crate::model::TaskProgress {
                    completed: event.completed,
                    total: event.total,
                });
            }
        }
        FrameKind::Blob => {
            let (record, data) = storage::decode_blob_frame(&frame.body)?;
            blobs.register(&record, data);
        }
    }
    Ok(())
}

/// Write the full row set as frames, in replayable order: sessions, blobs,
/// tasks, then messages.
///
/// With `embed_blobs` set (archives), every blob frame carries its payload
/// bytes; otherwise only inline blobs do (file-backed payloads live in the
/// package's blobs directory).
pub(crate) fn write_snapshot_frames(
    writer: &mut LogWriter,
    tables: &Tables,
    blobs: &BlobStore,
    embed_blobs: bool,
) -> Result<()> {
    for session in &tables.sessions {
        let body = serde_json::to_vec(&SessionStarted {
            session: session.clone(),
        })?;
        writer.append_frame(FrameKind::Session, &body)?;
    }

    for key in blobs.keys() {
        if let Some(record) = blobs.record(&key) {
            let data = if embed_blobs || record.inline {
                Some(blobs.stored_bytes(&key)?)
            } else {
                None
            };
            let frame = storage::encode_blob_frame(&record, data.as_deref())?;
            writer.append_frame(FrameKind::Blob, &frame)?;
        }
    }

    for task in &tables.tasks {
        let kind = if task.state.is_terminal() {
            FrameKind::TaskCompleted
        } else {
            FrameKind::TaskBegan
        };
        let body = serde_json::to_vec(task)?;
        writer.append_frame(kind, &body)?;
    }

    for message in &tables.messages {
        let body = serde_json::to_vec(message)?;
        writer.append_frame(FrameKind::Message, &body)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::filter::Predicate;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config() -> StoreConfig {
        StoreConfig {
            clock: ManualClock::default().clock(),
            ..StoreConfig::default()
        }
    }

    fn memory_store() -> EventStore {
        EventStore::in_memory(test_config()).unwrap()
    }

    #[test]
    fn test_auto_started_session() {
        let store = memory_store();
        assert!(store.current_session().is_some());
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_store_message_roundtrip() {
        let store = memory_store();

        let id = store
            .store_message(MessageDraft {
                level: Level::Warning,
                label: "auth".to_string(),
                text: "token expired".to_string(),
                metadata: vec![("user".to_string(), "42".to_string())],
                file: "auth.rs".to_string(),
                function: "refresh".to_string(),
                line: 17,
                ..MessageDraft::default()
            })
            .unwrap();

        let messages = store.messages(&MessageQuery::all());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].level, Level::Warning);
        assert_eq!(messages[0].metadata.len(), 1);
        assert_eq!(messages[0].session_id, store.current_session().unwrap());
    }

    #[test]
    fn test_unknown_session_rejected() {
        let store = memory_store();

        let result = store.store_message(MessageDraft {
            session_id: Some(Uuid::new_v4()),
            ..MessageDraft::new(Level::Info, "app", "orphan")
        });
        assert!(matches!(result, Err(LoupeError::InvalidSession(_))));
    }

    #[test]
    fn test_no_active_session_rejected() {
        let store = EventStore::in_memory(StoreConfig {
            auto_start_session: false,
            clock: ManualClock::default().clock(),
            ..StoreConfig::default()
        })
        .unwrap();

        let result = store.store_message(MessageDraft::new(Level::Info, "app", "no session"));
        assert!(matches!(result, Err(LoupeError::InvalidSession(_))));

        store
            .start_session(Session::new(1, SessionInfo::default()))
            .unwrap();
        assert!(store
            .store_message(MessageDraft::new(Level::Info, "app", "ok now"))
            .is_ok());
    }

    #[test]
    fn test_task_lifecycle() {
        let store = memory_store();
        let task_id = Uuid::new_v4();

        store
            .begin_task(
                task_id,
                TaskKind::Data,
                TaskRequest {
                    url: "https://example.com/api".to_string(),
                    http_method: "GET".to_string(),
                    ..TaskRequest::default()
                },
            )
            .unwrap();

        let task = store.task(task_id).unwrap();
        assert_eq!(task.state, TaskState::Pending);

        store.update_task_progress(task_id, 50, 100).unwrap();
        let task = store.task(task_id).unwrap();
        assert_eq!(task.progress.unwrap().completed, 50);

        store
            .complete_task(
                task_id,
                TaskOutcome {
                    response: Some(TaskResponse {
                        status: 200,
                        headers: vec![],
                    }),
                    response_body: Some(b"{\"ok\":true}".to_vec()),
                    duration_ns: 1_000_000,
                    ..TaskOutcome::default()
                },
            )
            .unwrap();

        let task = store.task(task_id).unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert!(task.progress.is_none());
        assert_eq!(task.response_body_size, 11);
        let key = task.response_body.unwrap();
        assert_eq!(store.blobs().retrieve(&key).unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn test_task_backed_message_created() {
        let store = memory_store();
        let task_id = Uuid::new_v4();

        store
            .begin_task(
                task_id,
                TaskKind::Data,
                TaskRequest {
                    url: "https://example.com/x".to_string(),
                    http_method: "GET".to_string(),
                    ..TaskRequest::default()
                },
            )
            .unwrap();

        let messages = store.messages(&MessageQuery::all());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, Some(task_id));
        assert_eq!(messages[0].label, "network");
        assert_eq!(messages[0].text, "https://example.com/x");
    }

    #[test]
    fn test_terminal_updates_rejected() {
        let store = memory_store();
        let task_id = Uuid::new_v4();

        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();
        store.complete_task(task_id, TaskOutcome::default()).unwrap();

        assert!(matches!(
            store.complete_task(task_id, TaskOutcome::default()),
            Err(LoupeError::TaskAlreadyCompleted(_))
        ));
        assert!(matches!(
            store.update_task_progress(task_id, 1, 2),
            Err(LoupeError::TaskAlreadyCompleted(_))
        ));
    }

    #[test]
    fn test_unknown_task_rejected() {
        let store = memory_store();
        assert!(matches!(
            store.update_task_progress(Uuid::new_v4(), 1, 2),
            Err(LoupeError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.complete_task(Uuid::new_v4(), TaskOutcome::default()),
            Err(LoupeError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_failed_task_escalates_backing_message() {
        let store = memory_store();
        let task_id = Uuid::new_v4();

        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();
        store
            .complete_task(
                task_id,
                TaskOutcome {
                    error: Some(TaskError {
                        domain: "io".to_string(),
                        code: -1,
                        debug_description: "refused".to_string(),
                    }),
                    ..TaskOutcome::default()
                },
            )
            .unwrap();

        let messages = store.messages(&MessageQuery::matching(Predicate::LevelAtLeast(
            Level::Error,
        )));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, Some(task_id));
    }

    #[test]
    fn test_query_order_and_batching() {
        let store = memory_store();
        for i in 0..250 {
            store
                .store_message(MessageDraft::new(Level::Info, "seq", format!("{i}")))
                .unwrap();
        }

        let newest_first = store.messages(&MessageQuery::all());
        assert_eq!(newest_first.len(), 250);
        assert_eq!(newest_first[0].text, "249");
        assert_eq!(newest_first[249].text, "0");

        let batches: Vec<_> = store.messages_batched(&MessageQuery::all()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), QUERY_BATCH_SIZE);
        assert_eq!(batches[1].len(), QUERY_BATCH_SIZE);
        assert_eq!(batches[2].len(), 50);
        assert_eq!(batches[0][0].text, "249");
    }

    #[test]
    fn test_change_notifications() {
        let store = memory_store();
        let inserted = Arc::new(AtomicUsize::new(0));
        let updated = Arc::new(AtomicUsize::new(0));

        let (i, u) = (Arc::clone(&inserted), Arc::clone(&updated));
        let subscription = store.subscribe(move |change| match change.kind {
            crate::events::ChangeKind::Inserted => {
                i.fetch_add(1, Ordering::SeqCst);
            }
            crate::events::ChangeKind::Updated => {
                u.fetch_add(1, Ordering::SeqCst);
            }
            crate::events::ChangeKind::Deleted => {}
        });

        store
            .store_message(MessageDraft::new(Level::Info, "app", "one"))
            .unwrap();
        let task_id = Uuid::new_v4();
        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();
        store.complete_task(task_id, TaskOutcome::default()).unwrap();

        // message + (backing message + task) inserts, task update
        assert_eq!(inserted.load(Ordering::SeqCst), 3);
        assert_eq!(updated.load(Ordering::SeqCst), 1);

        store.unsubscribe(subscription);
        store
            .store_message(MessageDraft::new(Level::Info, "app", "two"))
            .unwrap();
        assert_eq!(inserted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_info_counts_plain_messages_only() {
        let store = memory_store();

        store
            .store_message(MessageDraft::new(Level::Info, "app", "plain"))
            .unwrap();
        let task_id = Uuid::new_v4();
        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();

        let info = store.info();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.task_count, 1);
        assert_eq!(info.store_id, store.store_id());
    }

    #[test]
    fn test_reopen_preserves_rows_and_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.loupe");
        let task_id = Uuid::new_v4();

        let store_id = {
            let store =
                EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
            store
                .store_message(MessageDraft::new(Level::Info, "app", "persisted"))
                .unwrap();
            store
                .begin_task(task_id, TaskKind::Data, TaskRequest::default())
                .unwrap();
            store
                .complete_task(
                    task_id,
                    TaskOutcome {
                        response_body: Some(b"body-bytes".to_vec()),
                        ..TaskOutcome::default()
                    },
                )
                .unwrap();
            store.flush().unwrap();
            store.store_id()
        };

        let store = EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
        assert_eq!(store.store_id(), store_id);

        let messages = store.messages(&MessageQuery::all());
        assert_eq!(messages.len(), 2);

        let task = store.task(task_id).unwrap();
        assert_eq!(task.state, TaskState::Success);
        let key = task.response_body.unwrap();
        assert_eq!(store.blobs().retrieve(&key).unwrap(), b"body-bytes");
    }

    #[test]
    fn test_reopen_starts_new_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.loupe");

        let first_session = {
            let store =
                EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
            store.current_session().unwrap()
        };

        let store = EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
        let second_session = store.current_session().unwrap();
        assert_ne!(first_session, second_session);
        assert_eq!(store.sessions().len(), 2);
    }

    #[test]
    fn test_version_mismatch_opens_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.loupe");

        let store_id = {
            let store =
                EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
            store
                .store_message(MessageDraft::new(Level::Info, "app", "will be lost"))
                .unwrap();
            store.flush().unwrap();
            store.store_id()
        };

        // Bump the version field and reseal so only the version mismatches
        let log_path = path.join(LOG_FILENAME);
        let mut bytes = std::fs::read(&log_path).unwrap();
        let mut header: FileHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        header.version = FILE_VERSION + 1;
        header.seal();
        bytes[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        std::fs::write(&log_path, &bytes).unwrap();

        let store = EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
        // Data-loss over total failure: contents reset, identity kept
        assert_eq!(store.store_id(), store_id);
        let plain: Vec<_> = store
            .messages(&MessageQuery::all())
            .into_iter()
            .filter(|m| m.text == "will be lost")
            .collect();
        assert!(plain.is_empty());
        // And the store accepts new writes
        assert!(store
            .store_message(MessageDraft::new(Level::Info, "app", "fresh"))
            .is_ok());
    }

    #[test]
    fn test_readonly_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diag.loupe");
        {
            let _store =
                EventStore::open(&path, OpenOptions::create(), test_config()).unwrap();
        }

        let readonly = EventStore::open(
            &path,
            OpenOptions::readonly(),
            StoreConfig {
                auto_start_session: false,
                clock: ManualClock::default().clock(),
                ..StoreConfig::default()
            },
        )
        .unwrap();

        assert!(matches!(
            readonly.store_message(MessageDraft::new(Level::Info, "app", "nope")),
            Err(LoupeError::Readonly)
        ));
        assert!(matches!(
            readonly.begin_task(Uuid::new_v4(), TaskKind::Data, TaskRequest::default()),
            Err(LoupeError::Readonly)
        ));
        assert!(matches!(readonly.remove_all(), Err(LoupeError::Readonly)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.loupe");

        let result = EventStore::open(&path, OpenOptions::default(), test_config());
        assert!(matches!(result, Err(LoupeError::FileDoesntExist(_))));
    }

    #[test]
    fn test_handle_external_events() {
        let source = memory_store();
        let mirror = memory_store();

        // The mirror learns about the peer's session first (handshake)
        let session = source
            .sessions()
            .into_iter()
            .next()
            .unwrap();
        mirror.start_session(session).unwrap();

        let task_id = Uuid::new_v4();
        let completed = NetworkTaskCompleted {
            task_id,
            kind: TaskKind::Data,
            created_at: 5,
            session_id: source.current_session().unwrap(),
            duration_ns: 100,
            request: TaskRequest {
                url: "https://example.com".to_string(),
                http_method: "GET".to_string(),
                ..TaskRequest::default()
            },
            response: Some(TaskResponse {
                status: 200,
                headers: vec![],
            }),
            error: None,
            request_body: None,
            response_body: Some(b"mirrored".to_vec()),
            metrics: vec![],
        };

        // Completion without a prior create materializes the task
        mirror
            .handle(StoreEvent::NetworkTaskCompleted(completed))
            .unwrap();

        let task = mirror.task(task_id).unwrap();
        assert_eq!(task.state, TaskState::Success);
        let key = task.response_body.unwrap();
        assert_eq!(mirror.blobs().retrieve(&key).unwrap(), b"mirrored");

        // Unknown session is rejected, not silently adopted
        let result = mirror.handle(StoreEvent::MessageStored(MessageStored {
            created_at: 0,
            level: Level::Info,
            label: "app".to_string(),
            text: "stray".to_string(),
            metadata: vec![],
            session_id: Uuid::new_v4(),
            file: String::new(),
            function: String::new(),
            line: 0,
        }));
        assert!(matches!(result, Err(LoupeError::InvalidSession(_))));
    }

    #[test]
    fn test_remove_sessions_cascades() {
        let store = memory_store();
        let first = store.current_session().unwrap();

        store
            .store_message(MessageDraft::new(Level::Info, "app", "first session"))
            .unwrap();
        let task_id = Uuid::new_v4();
        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();
        store
            .complete_task(
                task_id,
                TaskOutcome {
                    response_body: Some(b"doomed blob".to_vec()),
                    ..TaskOutcome::default()
                },
            )
            .unwrap();

        store
            .start_session(Session::new(999, SessionInfo::default()))
            .unwrap();
        store
            .store_message(MessageDraft::new(Level::Info, "app", "second session"))
            .unwrap();

        store
            .remove_sessions(&[first].into_iter().collect())
            .unwrap();

        let messages = store.messages(&MessageQuery::all());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "second session");
        assert!(store.task(task_id).is_none());
        assert!(store.blobs().is_empty());
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_remove_all() {
        let store = memory_store();
        store
            .store_message(MessageDraft::new(Level::Info, "app", "gone"))
            .unwrap();
        let task_id = Uuid::new_v4();
        store
            .begin_task(task_id, TaskKind::Data, TaskRequest::default())
            .unwrap();

        store.remove_all().unwrap();

        assert!(store.messages(&MessageQuery::all()).is_empty());
        assert!(store.tasks(&TaskQuery::all()).is_empty());
        // The current session survives so writes can continue
        assert!(store.current_session().is_some());
        assert!(store
            .store_message(MessageDraft::new(Level::Info, "app", "after clear"))
            .is_ok());
    }
}
