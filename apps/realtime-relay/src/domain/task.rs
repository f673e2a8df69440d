//! Background Task Types
//!
//! Jobs persisted in the shared store so several processes can drain one
//! queue.
//!
//! ```text
//! Pending → Processing → Completed
//!              │
//!              ├─(error, retries left)→ Pending
//!              └─(error, exhausted)──→ Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier.
pub type TaskId = String;

/// Scheduling priority. Higher priorities are always claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Claimed before anything else.
    High,
    /// Default priority.
    Medium,
    /// Claimed only when nothing else is pending.
    Low,
}

impl TaskPriority {
    /// Claim order, highest first.
    pub const CLAIM_ORDER: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker slot.
    Processing,
    /// Handler returned successfully.
    Completed,
    /// Retries exhausted.
    Failed,
}

impl TaskStatus {
    /// Whether no further transitions happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Handler discriminator.
    pub task_type: String,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// Attempts that have failed so far.
    pub retries: u32,
    /// Failed attempts allowed before the task is marked failed.
    pub max_retries: u32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the current or last attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

impl Task {
    /// Create a pending task.
    #[must_use]
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Mark as claimed by a worker.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Mark as completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.last_error = None;
    }

    /// Record a failed attempt.
    ///
    /// Returns the new status: `Pending` if a retry remains, `Failed` otherwise.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> TaskStatus {
        self.retries += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.retries > self.max_retries {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
        } else {
            self.status = TaskStatus::Pending;
            self.started_at = None;
        }
        self.status
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("refresh", json!({}), TaskPriority::Medium, 2, Utc::now());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn failing_past_max_retries_is_terminal() {
        let now = Utc::now();
        let mut task = Task::new("refresh", json!({}), TaskPriority::High, 1, now);

        task.start(now);
        assert_eq!(task.fail("boom", now), TaskStatus::Pending);
        assert!(task.started_at.is_none());

        task.start(now);
        assert_eq!(task.fail("boom again", now), TaskStatus::Failed);
        assert!(task.status.is_terminal());
        assert_eq!(task.retries, 2);
        assert_eq!(task.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::High < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::Low);
        assert_eq!(
            serde_json::to_string(&TaskPriority::High).unwrap(),
            "\"high\""
        );
    }
}
