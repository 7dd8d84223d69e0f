//! Progress events
//!
//! Every stage transition is published on a broadcast channel. Consumers
//! subscribe independently; a slow or failing consumer never blocks the
//! workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::task::{Stage, TaskId};

/// Stage transition notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub stage: Stage,
    pub message: String,
    pub percentage: u8,
    /// Result recorded for the stage, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            task_id,
            stage,
            message: message.into(),
            percentage: stage.percentage(),
            result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        if !result.is_null() {
            self.result = Some(result);
        }
        self
    }
}

/// Callback invoked for every progress event
pub type Observer = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Run `observer` on its own task, fed from `events`.
///
/// Panics raised by the observer are caught and logged. The task ends when
/// every sender is dropped.
pub(crate) fn spawn_observer(
    mut events: broadcast::Receiver<ProgressEvent>,
    observer: Observer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                        tracing::warn!(
                            task_id = %event.task_id,
                            stage = %event.stage,
                            "progress observer panicked"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress observer lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_percentage_follows_stage() {
        let event = ProgressEvent::new(TaskId::new(), Stage::Merging, "merging");
        assert_eq!(event.percentage, 80);
        assert!(event.result.is_none());

        let event = event.with_result(serde_json::json!({"added": 1}));
        assert!(event.result.is_some());
    }

    #[tokio::test]
    async fn test_observer_survives_panics() {
        let (tx, rx) = broadcast::channel(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let observer: Observer = Arc::new(move |event: &ProgressEvent| {
            seen_clone.lock().unwrap().push(event.stage);
            if event.stage == Stage::Started {
                panic!("observer failure");
            }
        });
        let handle = spawn_observer(rx, observer);

        let id = TaskId::new();
        tx.send(ProgressEvent::new(id, Stage::Started, "started")).unwrap();
        tx.send(ProgressEvent::new(id, Stage::Completed, "done")).unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Stage::Started, Stage::Completed]);
    }
}
