/// Transfer models shared between the coordinator and the network client.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::TransferError;

/// Identifier of a registered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue mode: how many transfers may be in flight at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// One active transfer at a time.
    Serial,
    /// Every registered transfer starts immediately.
    #[default]
    Parallel,
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueMode::Serial => write!(f, "serial"),
            QueueMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Username/password pair handed out on an authentication challenge.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty()
    }

    /// Hand out the stored pair, leaving empty credentials behind.
    pub fn take(&mut self) -> Credentials {
        std::mem::take(self)
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// HTTP method used for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    Put,
    Post,
}

impl std::fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMethod::Put => write!(f, "PUT"),
            UploadMethod::Post => write!(f, "POST"),
        }
    }
}

/// Direction-specific payload of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Download { destination: PathBuf },
    Upload { source: PathBuf, method: UploadMethod },
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::Download { .. } => "download",
            Direction::Upload { .. } => "upload",
        }
    }
}

/// Request parameters of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Queued => write!(f, "queued"),
            TransferStatus::Running => write!(f, "running"),
            TransferStatus::Done => write!(f, "done"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Final result reported by the network client for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub http_status: Option<u16>,
    pub bytes: u64,
    pub error: Option<TransferError>,
}

impl TransferOutcome {
    pub fn succeeded(http_status: u16, bytes: u64) -> Self {
        Self {
            http_status: Some(http_status),
            bytes,
            error: None,
        }
    }

    pub fn failed(http_status: Option<u16>, error: TransferError) -> Self {
        Self {
            http_status,
            bytes: 0,
            error: Some(error),
        }
    }
}

/// One pending or active transfer.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: TransferId,
    pub request: TransferRequest,
    pub direction: Direction,
    /// Handed out once on the first authentication challenge.
    pub credentials: Credentials,
    pub status: TransferStatus,
    pub http_status: Option<u16>,
    pub error: Option<TransferError>,
    pub transferred: u64,
    pub total: Option<u64>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    fn new(request: TransferRequest, direction: Direction, credentials: Credentials) -> Self {
        Self {
            id: TransferId::new(),
            request,
            direction,
            credentials,
            status: TransferStatus::Queued,
            http_status: None,
            error: None,
            transferred: 0,
            total: None,
            registered_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// A GET of `request` saved to `destination`.
    pub fn download(
        request: TransferRequest,
        credentials: Credentials,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            request,
            Direction::Download { destination: destination.into() },
            credentials,
        )
    }

    /// A PUT/POST of `source` to `request`.
    ///
    /// Fails when the source file can't be opened, so unreadable uploads are
    /// never registered.
    pub fn upload(
        request: TransferRequest,
        credentials: Credentials,
        source: impl Into<PathBuf>,
        method: UploadMethod,
    ) -> Result<Self, TransferError> {
        let source = source.into();
        std::fs::File::open(&source).map_err(|e| TransferError::SourceUnavailable {
            path: source.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(request, Direction::Upload { source, method }, credentials))
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = TransferStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_finished(&mut self, outcome: TransferOutcome) {
        self.http_status = outcome.http_status;
        if outcome.bytes > 0 {
            self.transferred = outcome.bytes;
        }
        self.status = if outcome.error.is_some() {
            TransferStatus::Failed
        } else {
            TransferStatus::Done
        };
        self.error = outcome.error;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_take_leaves_empty() {
        let mut creds = Credentials::new("alice", "secret");
        let handed = creds.take();
        assert_eq!(handed, Credentials::new("alice", "secret"));
        assert!(creds.is_empty());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "secret");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_upload_requires_readable_source() {
        let result = TransferTask::upload(
            TransferRequest::new("http://example.com/up"),
            Credentials::default(),
            "/definitely/not/here.bin",
            UploadMethod::Put,
        );
        assert!(matches!(result, Err(TransferError::SourceUnavailable { .. })));
    }

    #[test]
    fn test_mark_finished_with_error() {
        let mut task = TransferTask::download(
            TransferRequest::new("http://example.com/a"),
            Credentials::default(),
            "a",
        );
        task.mark_started();
        assert_eq!(task.status, TransferStatus::Running);

        let error = TransferError::from_status(500, None);
        task.mark_finished(TransferOutcome::failed(Some(500), error));
        assert_eq!(task.status, TransferStatus::Failed);
        assert_eq!(task.http_status, Some(500));
        assert!(task.finished_at.is_some());
        assert!(task.error.is_some());
    }

    #[test]
    fn test_queue_mode_default_is_parallel() {
        assert_eq!(QueueMode::default(), QueueMode::Parallel);
        assert_eq!(serde_json::to_string(&QueueMode::Serial).unwrap(), "\"serial\"");
    }
}
