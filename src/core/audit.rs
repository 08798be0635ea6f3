//! Run status and statistics for one pipeline execution.

use crate::core::transform::TransformStats;
use crate::domain::ports::RunObserver;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Initialised,
    Started,
    Running,
    Finished,
    /// Completed, but some rows were rejected.
    FinishedErrors,
    Abended,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::FinishedErrors | RunStatus::Abended | RunStatus::Cancelled
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::FinishedErrors)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunStatus::Initialised => "initialised",
            RunStatus::Started => "started",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::FinishedErrors => "finished with errors",
            RunStatus::Abended => "abended",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    pub run_name: String,
    pub audit_key: i64,
    pub status: RunStatus,
    pub message: Option<String>,
    pub exception_details: Option<String>,
    pub rows_total: u64,
    pub rows_created: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_rejected: u64,
    pub rows_ignored: u64,
    pub rows_filtered: u64,
    pub rows_sorted: u64,
    pub rows_preserved: u64,
    pub rows_read_primary: u64,
    pub rows_read_reference: u64,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

impl RunResult {
    pub fn new(run_name: impl Into<String>, audit_key: i64) -> Self {
        Self {
            run_name: run_name.into(),
            audit_key,
            ..Self::default()
        }
    }

    /// Moves to `status`. Terminal states are final: returns false and leaves
    /// the result untouched once one has been reached.
    pub fn set_status(&mut self, status: RunStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = chrono::Local::now().naive_local();
        if status == RunStatus::Started {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        true
    }

    /// Copies the counters a transform chain keeps into the result.
    pub fn absorb_stats(&mut self, stats: &TransformStats) {
        self.rows_ignored = stats.rows_ignored;
        self.rows_filtered = stats.rows_filtered;
        self.rows_sorted = stats.rows_sorted;
        self.rows_preserved = stats.rows_preserved;
        self.rows_read_primary = stats.rows_read_primary;
        self.rows_read_reference = stats.rows_read_reference;
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_created + self.rows_updated + self.rows_deleted
    }
}

/// Logs every transition and the final counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_status(&self, result: &RunResult) {
        match result.status {
            RunStatus::Abended => tracing::error!(
                "❌ Run '{}' abended: {}",
                result.run_name,
                result.message.as_deref().unwrap_or("no message")
            ),
            RunStatus::Cancelled => tracing::warn!("Run '{}' was cancelled", result.run_name),
            status => tracing::info!("Run '{}' {}", result.run_name, status),
        }
    }

    fn on_progress(&self, result: &RunResult) {
        tracing::debug!(
            "Run '{}': {} rows read, {} created, {} updated, {} deleted",
            result.run_name,
            result.rows_total,
            result.rows_created,
            result.rows_updated,
            result.rows_deleted
        );
    }

    fn on_finish(&self, result: &RunResult) {
        tracing::info!(
            "📊 Run '{}' {}: {} created, {} updated, {} deleted, {} rejected, {} ignored",
            result.run_name,
            result.status,
            result.rows_created,
            result.rows_updated,
            result.rows_deleted,
            result.rows_rejected,
            result.rows_ignored
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Status(RunResult),
    Progress(RunResult),
    Finished(RunResult),
}

/// Forwards snapshots to a channel the caller polls.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: RunEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl RunObserver for ChannelObserver {
    fn on_status(&self, result: &RunResult) {
        self.send(RunEvent::Status(result.clone()));
    }

    fn on_progress(&self, result: &RunResult) {
        self.send(RunEvent::Progress(result.clone()));
    }

    fn on_finish(&self, result: &RunResult) {
        self.send(RunEvent::Finished(result.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_final() {
        let mut result = RunResult::new("customers", 1);
        assert!(result.set_status(RunStatus::Started, None));
        assert!(result.started_at.is_some());
        assert!(result.set_status(RunStatus::Abended, Some("disk full".to_string())));
        assert!(!result.set_status(RunStatus::Finished, None));
        assert_eq!(result.status, RunStatus::Abended);
        assert_eq!(result.message.as_deref(), Some("disk full"));
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_result_serializes_status_in_snake_case() {
        let mut result = RunResult::new("customers", 1);
        result.set_status(RunStatus::FinishedErrors, None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "finished_errors");
        assert_eq!(json["run_name"], "customers");
    }

    #[tokio::test]
    async fn test_channel_observer_forwards_snapshots() {
        let (observer, mut rx) = ChannelObserver::new();
        let mut result = RunResult::new("customers", 1);
        result.set_status(RunStatus::Running, None);
        observer.on_status(&result);
        result.rows_created = 3;
        observer.on_finish(&result);

        assert!(matches!(rx.recv().await, Some(RunEvent::Status(r)) if r.status == RunStatus::Running));
        match rx.recv().await {
            Some(RunEvent::Finished(r)) => assert_eq!(r.rows_created, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
