//! Common types for Mailburst

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants
pub type TenantId = Uuid;

/// Unique identifier for dispatch jobs
pub type JobId = Uuid;

/// Resolved relay settings for one job, supplied by the settings collaborator.
///
/// Immutable for the life of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Relay hostname
    pub host: String,

    /// Relay port
    pub port: u16,

    /// Account username; also used as the sender and Reply-To address
    pub username: String,

    /// Account credential
    pub credential: String,

    /// Optional display name for the From header
    #[serde(default)]
    pub sender_name: Option<String>,

    /// Base inter-send delay in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
}

fn default_delay_seconds() -> f64 {
    5.0
}

impl TransportConfig {
    /// Check the non-empty-field invariant (sender_name may be absent)
    pub fn validate(&self) -> crate::Result<()> {
        if self.host.is_empty() {
            return Err(crate::Error::Config("relay host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(crate::Error::Config("relay port is zero".to_string()));
        }
        if self.username.is_empty() {
            return Err(crate::Error::Config("relay username is empty".to_string()));
        }
        if self.credential.is_empty() {
            return Err(crate::Error::Config("relay credential is empty".to_string()));
        }
        if self.delay_seconds < 0.0 {
            return Err(crate::Error::Config(format!(
                "inter-send delay must be >= 0, got {}",
                self.delay_seconds
            )));
        }
        Ok(())
    }

    /// Domain used for generated Message-IDs: the sender address domain,
    /// falling back to the relay host.
    pub fn message_id_domain(&self) -> &str {
        self.username
            .split_once('@')
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.host)
    }
}

/// Message content sent to every recipient of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A decoded attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// Job submission input from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

/// Attachment as submitted: content is base64-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInput {
    pub filename: String,
    pub mime_type: String,
    pub content_base64: String,
}

/// Why a recipient failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    BadFormat,
    DisposableDomain,
    NoMxRecord,
    LookupError,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::BadFormat => "bad_format",
            InvalidReason::DisposableDomain => "disposable_domain",
            InvalidReason::NoMxRecord => "no_mx_record",
            InvalidReason::LookupError => "lookup_error",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of a failed send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Recipient never reached the relay
    Validation(InvalidReason),
    /// Relay rejected the send, or transient failures exhausted all retries
    Rejected,
}

/// Outcome of one recipient's dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Failed { kind: FailureKind, error: String },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Per-recipient dispatch record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub recipient: String,
    pub outcome: SendOutcome,
    /// Total attempts made, including the successful one
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    PartialFailure,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartialFailure | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::PartialFailure => write!(f, "partial_failure"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "partial_failure" => Ok(JobState::PartialFailure),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Point-in-time snapshot of a job, safe to hand to external status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub state: JobState,
    pub total: usize,
    pub processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal job summary emitted once per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub total: usize,
    pub processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Fraction of *processed* recipients that succeeded; 0.0 when none
    /// were processed.
    pub success_rate: f64,
    pub failed_recipients: Vec<String>,
}

/// What one send attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    Invalid,
    TransientFailure,
    PermanentFailure,
    TransportUnavailable,
}

/// Progress event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SendAttempt {
        recipient: String,
        /// 1-based attempt number
        attempt: u32,
        outcome: AttemptOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    BatchSummary {
        /// 1-based batch index
        batch_index: usize,
        batch_count: usize,
        processed: usize,
        success_count: usize,
        failed_count: usize,
        elapsed_ms: u64,
    },
    JobSummary { summary: JobSummary },
}

/// Progress event consumed by the external log/broadcast sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventKind,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, tenant_id: TenantId, event: EventKind) -> Self {
        Self {
            job_id,
            tenant_id,
            timestamp: Utc::now(),
            event,
        }
    }
}
