//! Record types stored by the event store

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobKey;

/// Stable row identifier for a message
pub type MessageId = u64;

/// Message severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Fine-grained tracing
    Trace,
    /// Debug-level diagnostics
    #[default]
    Debug,
    /// Informational
    Info,
    /// Normal but significant
    Notice,
    /// Something unexpected, not yet an error
    Warning,
    /// An operation failed
    Error,
    /// The application cannot continue normally
    Critical,
}

impl Level {
    /// All levels in ascending severity order
    pub const ALL: [Level; 7] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Notice,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    /// Numeric wire representation
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the numeric wire representation
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

/// Application/environment metadata captured when a session starts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Host application name
    pub app_name: String,
    /// Host application version
    pub app_version: String,
    /// Operating system name
    pub os_name: String,
    /// Operating system version or architecture
    pub os_version: String,
}

impl SessionInfo {
    /// Metadata describing the current process and platform.
    #[must_use]
    pub fn current() -> Self {
        let app_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();

        Self {
            app_name,
            app_version: String::new(),
            os_name: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
        }
    }
}

/// One recording lifetime; the top-level scoping unit for messages and tasks.
///
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session token
    pub id: Uuid,
    /// Start time in nanoseconds since the Unix epoch
    pub started_at: u64,
    /// Application/environment metadata
    pub info: SessionInfo,
}

impl Session {
    /// Create a session with a fresh id.
    #[must_use]
    pub fn new(started_at: u64, info: SessionInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            info,
        }
    }
}

/// A stored log message.
///
/// Write-once: metadata is attached at creation and never mutated. The only
/// post-insert change is the level escalation applied to a task-backed
/// message when its task fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable row id, monotonically assigned per store
    pub id: MessageId,
    /// Creation time in nanoseconds since the Unix epoch
    pub created_at: u64,
    /// Severity
    pub level: Level,
    /// Subsystem label, e.g. "network" or "auth"
    pub label: String,
    /// Owning session
    pub session_id: Uuid,
    /// Message text
    pub text: String,
    /// Ordered key/value pairs, owned exclusively by this message
    #[serde(default)]
    pub metadata: Vec<(String, String)>,
    /// Source file
    pub file: String,
    /// Source function
    pub function: String,
    /// Source line
    pub line: u32,
    /// Backing network task, if this message represents one
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

/// Network task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Request/response exchange
    #[default]
    Data,
    /// Body upload
    Upload,
    /// Body download
    Download,
}

impl TaskKind {
    /// Numeric wire representation
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the numeric wire representation
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Upload),
            2 => Some(Self::Download),
            _ => None,
        }
    }
}

/// Network task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created, not yet finished
    #[default]
    Pending,
    /// Finished without error
    Success,
    /// Finished with an error or failure status
    Failure,
}

impl TaskState {
    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Cache policy recorded for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Use the protocol's default caching behavior
    #[default]
    UseProtocol,
    /// Ignore any locally cached data
    ReloadIgnoringLocalCache,
    /// Use cached data if present, otherwise load
    ReturnCacheDataElseLoad,
    /// Use cached data only, never load
    ReturnCacheDataDontLoad,
}

impl CachePolicy {
    /// Numeric wire representation
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the numeric wire representation
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UseProtocol),
            1 => Some(Self::ReloadIgnoringLocalCache),
            2 => Some(Self::ReturnCacheDataElseLoad),
            3 => Some(Self::ReturnCacheDataDontLoad),
            _ => None,
        }
    }
}

/// Request transport options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Cellular access allowed
    pub allows_cellular_access: bool,
    /// Expensive network access allowed
    pub allows_expensive_access: bool,
    /// Constrained network access allowed
    pub allows_constrained_access: bool,
    /// Cookies handled automatically
    pub should_handle_cookies: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            allows_cellular_access: true,
            allows_expensive_access: true,
            allows_constrained_access: true,
            should_handle_cookies: true,
        }
    }
}

impl RequestOptions {
    /// Pack into a wire bitfield
    #[must_use]
    pub fn to_bits(self) -> u8 {
        u8::from(self.allows_cellular_access)
            | u8::from(self.allows_expensive_access) << 1
            | u8::from(self.allows_constrained_access) << 2
            | u8::from(self.should_handle_cookies) << 3
    }

    /// Unpack from a wire bitfield
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self {
            allows_cellular_access: bits & 1 != 0,
            allows_expensive_access: bits & (1 << 1) != 0,
            allows_constrained_access: bits & (1 << 2) != 0,
            should_handle_cookies: bits & (1 << 3) != 0,
        }
    }
}

/// The request half of a network task (1:1 sub-record)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Absolute URL
    pub url: String,
    /// HTTP method
    pub http_method: String,
    /// Request headers in original order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Cache policy
    #[serde(default)]
    pub cache_policy: CachePolicy,
    /// Transport options
    #[serde(default)]
    pub options: RequestOptions,
}

/// The response half of a network task (1:1 sub-record)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers in original order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Error recorded for a failed task
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskError {
    /// Error domain, e.g. "NSURLErrorDomain" or "io"
    pub domain: String,
    /// Domain-specific error code
    pub code: i64,
    /// Human-readable diagnostic description
    pub debug_description: String,
}

/// Transfer progress for an in-flight task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Units completed so far
    pub completed: i64,
    /// Total expected units, -1 when unknown
    pub total: i64,
}

/// How a transaction's response was fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// Loaded over the network
    #[default]
    NetworkLoad,
    /// Served from the local cache
    LocalCache,
    /// Pushed by the server
    ServerPush,
}

impl FetchKind {
    /// Numeric wire representation
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the numeric wire representation
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NetworkLoad),
            1 => Some(Self::LocalCache),
            2 => Some(Self::ServerPush),
            _ => None,
        }
    }
}

/// Per-transaction timing, transfer sizes, and connection info.
///
/// Timestamps are nanoseconds since the Unix epoch, 0 when not observed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionMetrics {
    /// How the response was fetched
    pub fetch_kind: FetchKind,
    /// Fetch start
    pub fetch_start: u64,
    /// First request byte sent
    pub request_start: u64,
    /// First response byte received
    pub response_start: u64,
    /// Last response byte received
    pub response_end: u64,
    /// Request header bytes sent
    pub request_header_bytes: u64,
    /// Request body bytes sent
    pub request_body_bytes: u64,
    /// Response header bytes received
    pub response_header_bytes: u64,
    /// Response body bytes received
    pub response_body_bytes: u64,
    /// Negotiated protocol, e.g. "h2"
    pub network_protocol: String,
    /// Remote peer address
    pub remote_address: String,
    /// Negotiated TLS version, if the connection was secure
    #[serde(default)]
    pub tls_version: Option<String>,
    /// Whether an existing connection was reused
    #[serde(default)]
    pub is_reused_connection: bool,
}

/// The authoritative record of one network task.
///
/// Mutable only until a terminal state is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTask {
    /// Task id, assigned by the caller at creation
    pub id: Uuid,
    /// Owning session
    pub session_id: Uuid,
    /// Task kind
    pub kind: TaskKind,
    /// Lifecycle state
    pub state: TaskState,
    /// Creation time in nanoseconds since the Unix epoch
    pub created_at: u64,
    /// Total duration in nanoseconds, 0 until completed
    #[serde(default)]
    pub duration_ns: u64,
    /// Request URL (denormalized from the request for fast filtering)
    pub url: String,
    /// HTTP method (denormalized)
    pub http_method: String,
    /// Full request sub-record
    pub request: TaskRequest,
    /// Response sub-record, present after completion
    #[serde(default)]
    pub response: Option<TaskResponse>,
    /// Per-transaction metrics, present after completion
    #[serde(default)]
    pub metrics: Vec<TransactionMetrics>,
    /// Transfer progress, cleared on completion
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    /// Error details for failed tasks
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Request body size in bytes, -1 when unknown
    #[serde(default = "unknown_size")]
    pub request_body_size: i64,
    /// Response body size in bytes, -1 when unknown
    #[serde(default = "unknown_size")]
    pub response_body_size: i64,
    /// Stored request body, if any
    #[serde(default)]
    pub request_body: Option<BlobKey>,
    /// Stored response body, if any
    #[serde(default)]
    pub response_body: Option<BlobKey>,
    /// Row id of the backing message
    pub message_id: MessageId,
}

fn unknown_size() -> i64 {
    -1
}

impl NetworkTask {
    /// Blob keys referenced by this task.
    pub fn blob_refs(&self) -> impl Iterator<Item = &BlobKey> {
        self.request_body.iter().chain(self.response_body.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Notice);
        assert!(Level::Notice < Level::Warning);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Error < Level::Critical);
    }

    #[test]
    fn test_level_wire_roundtrip() {
        for level in Level::ALL {
            assert_eq!(Level::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(Level::from_u8(7), None);
    }

    #[test]
    fn test_level_serde_names() {
        assert_eq!(serde_json::to_string(&Level::Warning).unwrap(), "\"warning\"");
        let level: Level = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, Level::Critical);
    }

    #[test]
    fn test_request_options_bits_roundtrip() {
        for bits in 0..16u8 {
            let options = RequestOptions::from_bits(bits);
            assert_eq!(options.to_bits(), bits);
        }
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
    }

    #[test]
    fn test_session_ids_unique() {
        let a = Session::new(0, SessionInfo::default());
        let b = Session::new(0, SessionInfo::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_message_row_serde_defaults() {
        // Older rows without the optional fields still deserialize
        let json = r#"{
            "id": 1,
            "created_at": 10,
            "level": "info",
            "label": "app",
            "session_id": "6b1e6d3e-8c4c-4a8f-9f2e-3c1a2b4c5d6e",
            "text": "hello",
            "file": "main.rs",
            "function": "main",
            "line": 3
        }"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert!(message.metadata.is_empty());
        assert!(message.task_id.is_none());
    }
}
