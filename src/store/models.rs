use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Job identity
// =============================================================================

/// Identifies where a job is defined: a code repository plus the job's name
/// within it.
///
/// The derived [`JobOrigin::id`] is the stable key every other record hangs
/// off, so a job keeps its history across process restarts and redeploys as
/// long as its origin does not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    pub repository_origin_id: String,
    pub job_name: String,
}

impl JobOrigin {
    pub fn new<R: Into<String>, N: Into<String>>(repository_origin_id: R, job_name: N) -> Self {
        Self {
            repository_origin_id: repository_origin_id.into(),
            job_name: job_name.into(),
        }
    }

    /// Stable origin id: hex SHA-256 over `repository_origin_id "/" job_name`.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.repository_origin_id.as_bytes());
        hasher.update(b"/");
        hasher.update(self.job_name.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Kind of job a state row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Schedule,
    Sensor,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Schedule => "schedule",
            JobType::Sensor => "sensor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(JobType::Schedule),
            "sensor" => Some(JobType::Sensor),
            _ => None,
        }
    }
}

/// Whether a job is currently being evaluated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }
}

/// Lifecycle status of a single evaluation attempt.
///
/// `Started` is the only creation status; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTickStatus {
    Started,
    Skipped,
    Success,
    Failure,
}

impl JobTickStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTickStatus::Started => "started",
            JobTickStatus::Skipped => "skipped",
            JobTickStatus::Success => "success",
            JobTickStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(JobTickStatus::Started),
            "skipped" => Some(JobTickStatus::Skipped),
            "success" => Some(JobTickStatus::Success),
            "failure" => Some(JobTickStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobTickStatus::Started)
    }
}

impl std::fmt::Display for JobTickStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Job state
// =============================================================================

/// Type-specific payload of a job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpecificData {
    /// Cron-driven schedule.
    Schedule {
        cron_schedule: String,
        /// IANA timezone name the cron expression is evaluated in; UTC when
        /// absent.
        execution_timezone: Option<String>,
    },
    /// Polling sensor.
    Sensor {
        /// Minimum seconds between evaluations, if the sensor declares one.
        min_interval_secs: Option<u64>,
        /// Opaque progress cursor the sensor last committed.
        cursor: Option<String>,
    },
}

/// One row per schedulable / sensor-able job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub origin: JobOrigin,
    pub job_type: JobType,
    pub status: JobStatus,
    pub data: JobSpecificData,
}

impl JobState {
    pub fn new(origin: JobOrigin, job_type: JobType, status: JobStatus, data: JobSpecificData) -> Self {
        Self {
            origin,
            job_type,
            status,
            data,
        }
    }

    /// The stable key this state is stored under.
    pub fn origin_id(&self) -> String {
        self.origin.id()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_data(mut self, data: JobSpecificData) -> Self {
        self.data = data;
        self
    }
}

// =============================================================================
// Job ticks
// =============================================================================

/// Structured failure info attached to a `Failure` tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickError {
    pub message: String,
    /// Captured frames, outermost first. May be empty.
    #[serde(default)]
    pub stack: Vec<String>,
    pub cause: Option<Box<TickError>>,
}

impl TickError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
            cause: None,
        }
    }
}

/// What an evaluation loop supplies when opening a new tick.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTickInitData {
    pub job_origin_id: String,
    pub job_type: JobType,
    pub timestamp: DateTime<Utc>,
}

/// One evaluation attempt of a job.
///
/// `id` is assigned by the store and immutable. A tick outlives its job
/// state: deleting the state leaves its ticks queryable until they are
/// purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTick {
    pub id: i64,
    pub job_origin_id: String,
    pub job_type: JobType,
    pub status: JobTickStatus,
    pub timestamp: DateTime<Utc>,
    /// Run identifiers launched by this tick; empty for skipped ticks.
    pub run_ids: Vec<String>,
    /// Present only when `status` is `Failure`.
    pub error: Option<TickError>,
}

impl JobTick {
    pub fn with_status(mut self, status: JobTickStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_run_ids(mut self, run_ids: Vec<String>) -> Self {
        self.run_ids = run_ids;
        self
    }

    pub fn with_error(mut self, error: TickError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Per-status tick counts for one job. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTickStats {
    pub started: usize,
    pub skipped: usize,
    pub success: usize,
    pub failure: usize,
}

impl JobTickStats {
    pub fn total(&self) -> usize {
        self.started + self.skipped + self.success + self.failure
    }

    pub(crate) fn add(&mut self, status: JobTickStatus, count: usize) {
        match status {
            JobTickStatus::Started => self.started += count,
            JobTickStatus::Skipped => self.skipped += count,
            JobTickStatus::Success => self.success += count,
            JobTickStatus::Failure => self.failure += count,
        }
    }
}
