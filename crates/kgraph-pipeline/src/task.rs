//! Task model
//!
//! A task tracks one submitted text through extraction and merging.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing stage, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    SystemUpdate,
    Extraction,
    ExtractionCompleted,
    Merging,
    Completed,
    Failed,
    MergeFailed,
    Cancelled,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::SystemUpdate => "system_update",
            Self::Extraction => "extraction",
            Self::ExtractionCompleted => "extraction_completed",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::MergeFailed => "merge_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Progress percentage reported with this stage
    pub fn percentage(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::SystemUpdate => 10,
            Self::Extraction => 30,
            Self::ExtractionCompleted => 60,
            Self::Merging => 80,
            Self::Completed | Self::Failed | Self::MergeFailed | Self::Cancelled => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result recorded when a task entered a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub timestamp: DateTime<Utc>,
    pub result: serde_json::Value,
}

/// One unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub status: TaskStatus,
    /// Most recent stage
    pub stage: Option<Stage>,
    pub stage_results: BTreeMap<Stage, StageRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            text: text.into(),
            status: TaskStatus::Pending,
            stage: None,
            stage_results: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Time from start (or creation, if never started) to finish
    pub fn duration(&self) -> Option<chrono::Duration> {
        let finished = self.finished_at?;
        Some(finished - self.started_at.unwrap_or(self.created_at))
    }

    pub(crate) fn record(&mut self, stage: Stage, result: serde_json::Value) {
        self.stage = Some(stage);
        self.stage_results.insert(
            stage,
            StageRecord {
                timestamp: Utc::now(),
                result,
            },
        );
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn status_report(&self) -> TaskStatusReport {
        TaskStatusReport {
            id: self.id,
            status: self.status,
            stage: self.stage,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration().map(|d| d.num_milliseconds()),
            error: self.error.clone(),
        }
    }
}

/// Status summary returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub id: TaskId,
    pub status: TaskStatus,
    pub stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}
