//! kgraph Pipeline - Concurrent knowledge graph construction
//!
//! This crate schedules submitted texts through the construction pipeline:
//! - A fixed pool of extraction workers running the schema advisor and the
//!   extractor in parallel against a private copy of the schema
//! - A single merge worker that owns the graph and applies candidates in
//!   completion order
//! - A task registry with bounded retention for finished tasks
//! - A broadcast stream of progress events
//!
//! The graph is written by the merge worker only. Readers get immutable
//! snapshots published after every merge.
//!
//! Author: hephaex@gmail.com

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use kgraph_core::{Graph, KgError, PipelineConfig, Result};
use kgraph_extractor::{Combiner, Extractor, SchemaAdvisor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod events;
mod merge;
pub mod registry;
pub mod task;
mod worker;

pub use events::{Observer, ProgressEvent};
pub use registry::{CancelOutcome, RetentionConfig, TaskRegistry};
pub use task::{Stage, StageRecord, Task, TaskId, TaskStatus, TaskStatusReport};

use events::spawn_observer;
use merge::MergeWorker;
use worker::{ExtractionWorker, PendingJob};

// ============================================================================
// Shared State
// ============================================================================

/// State shared by the pipeline handle and its workers
pub(crate) struct Shared {
    pub(crate) registry: TaskRegistry,
    pub(crate) events: broadcast::Sender<ProgressEvent>,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    fn publish(&self, event: ProgressEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }

    /// Record a stage transition for a running task and announce it.
    /// Returns false if the task was cancelled in the meantime.
    pub(crate) fn advance(
        &self,
        id: TaskId,
        stage: Stage,
        message: impl Into<String>,
        result: Value,
    ) -> bool {
        if !self.registry.record_stage(id, stage, result.clone()) {
            return false;
        }
        self.publish(ProgressEvent::new(id, stage, message).with_result(result));
        true
    }

    pub(crate) fn begin_merge(&self, id: TaskId) -> bool {
        if !self.registry.begin_merge(id) {
            return false;
        }
        self.publish(ProgressEvent::new(id, Stage::Merging, "merging candidates"));
        true
    }

    pub(crate) fn complete(&self, id: TaskId, result: Value) {
        self.registry.record_stage(id, Stage::Merging, result.clone());
        if self
            .registry
            .finish(id, TaskStatus::Completed, Stage::Completed, Value::Null, None)
        {
            tracing::debug!(task_id = %id, "task completed");
            self.publish(ProgressEvent::new(id, Stage::Completed, "completed").with_result(result));
        }
    }

    pub(crate) fn fail(&self, id: TaskId, stage: Stage, error: String) {
        let result = json!({ "error": error });
        if self
            .registry
            .finish(id, TaskStatus::Failed, stage, result.clone(), Some(error.clone()))
        {
            self.publish(ProgressEvent::new(id, stage, error).with_result(result));
        }
    }

    pub(crate) fn cancel(&self, id: TaskId) -> CancelOutcome {
        let outcome = self.registry.cancel(id);
        if outcome == CancelOutcome::Cancelled {
            tracing::debug!(task_id = %id, "task cancelled");
            self.publish(ProgressEvent::new(id, Stage::Cancelled, "cancelled"));
        }
        outcome
    }
}

// ============================================================================
// Public Types
// ============================================================================

/// How `Pipeline::shutdown` treats outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish every submitted task
    Drain,
    /// Cancel every task that has not started merging
    Cancel,
}

/// Graph and task counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub class_count: usize,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and starts a [`Pipeline`]
pub struct PipelineBuilder {
    graph: Graph,
    extractor: Arc<dyn Extractor>,
    advisor: Option<Arc<dyn SchemaAdvisor>>,
    config: PipelineConfig,
    observer: Option<Observer>,
}

impl PipelineBuilder {
    /// Schema advisor consulted before extraction
    pub fn with_advisor(mut self, advisor: Arc<dyn SchemaAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback invoked for every progress event
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Pipeline> {
        let config = self.config;
        if config.extraction_workers == 0 {
            return Err(KgError::Config(
                "extraction_workers must be at least 1".to_string(),
            ));
        }
        if config.event_capacity == 0 {
            return Err(KgError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        let retention = RetentionConfig {
            max_capacity: config.task_retention_capacity,
            ttl: Duration::from_secs(config.task_retention_ttl_secs),
        };
        let (events, _) = broadcast::channel(config.event_capacity);
        let observer = self
            .observer
            .map(|observer| spawn_observer(events.subscribe(), observer));

        let shared = Arc::new(Shared {
            registry: TaskRegistry::new(&retention),
            events,
            shutdown: CancellationToken::new(),
        });

        let (snapshot_tx, snapshot) = watch::channel(Arc::new(self.graph.clone()));
        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(intake_rx));

        let advisor = if config.schema_evolution {
            self.advisor
        } else {
            None
        };
        let combiner = Combiner::new()
            .strict(config.strict_merge)
            .with_policy(config.merge_policy);

        let merger = tokio::spawn(
            MergeWorker {
                shared: shared.clone(),
                queue: merge_rx,
                graph: self.graph,
                snapshot_tx,
                combiner,
            }
            .run(),
        );

        let workers = (0..config.extraction_workers)
            .map(|worker_id| {
                tokio::spawn(
                    ExtractionWorker {
                        worker_id,
                        shared: shared.clone(),
                        pending: pending.clone(),
                        merge_tx: merge_tx.clone(),
                        snapshot: snapshot.clone(),
                        extractor: self.extractor.clone(),
                        advisor: advisor.clone(),
                    }
                    .run(),
                )
            })
            .collect();
        drop(merge_tx);

        tracing::info!(
            workers = config.extraction_workers,
            strict = config.strict_merge,
            schema_evolution = advisor.is_some(),
            "pipeline started"
        );

        let guard = shared.shutdown.clone().drop_guard();
        Ok(Pipeline {
            shared,
            intake: StdMutex::new(Some(intake_tx)),
            pending,
            snapshot,
            workers,
            merger,
            observer,
            guard,
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Running construction pipeline
///
/// Dropping the handle without calling [`Pipeline::shutdown`] cancels all
/// outstanding work.
pub struct Pipeline {
    shared: Arc<Shared>,
    intake: StdMutex<Option<mpsc::UnboundedSender<PendingJob>>>,
    pending: Arc<Mutex<mpsc::UnboundedReceiver<PendingJob>>>,
    snapshot: watch::Receiver<Arc<Graph>>,
    workers: Vec<JoinHandle<()>>,
    merger: JoinHandle<Graph>,
    observer: Option<JoinHandle<()>>,
    guard: DropGuard,
}

impl Pipeline {
    pub fn builder(graph: Graph, extractor: Arc<dyn Extractor>) -> PipelineBuilder {
        PipelineBuilder {
            graph,
            extractor,
            advisor: None,
            config: PipelineConfig::default(),
            observer: None,
        }
    }

    /// Queue a text for processing
    pub fn submit(&self, text: impl Into<String>) -> Result<TaskId> {
        if self.shared.shutdown.is_cancelled() {
            return Err(KgError::PipelineStopped);
        }
        let intake = self
            .intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = intake.as_ref() else {
            return Err(KgError::PipelineStopped);
        };

        let text = text.into();
        let task = Task::new(text.clone());
        let id = task.id;
        self.shared.registry.insert(task);
        if sender.send(PendingJob { id, text }).is_err() {
            self.shared.fail(id, Stage::Failed, "intake queue closed".to_string());
            return Err(KgError::PipelineStopped);
        }

        tracing::debug!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Full copy of a task
    pub fn task(&self, id: TaskId) -> Result<Task> {
        self.shared
            .registry
            .get(id)
            .ok_or_else(|| KgError::TaskNotFound(id.to_string()))
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatusReport> {
        self.task(id).map(|task| task.status_report())
    }

    pub fn stage_results(&self, id: TaskId) -> Result<BTreeMap<Stage, StageRecord>> {
        self.task(id).map(|task| task.stage_results)
    }

    /// Cancel a task that has not started merging. Returns false if the
    /// task is already finished or merging.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        match self.shared.cancel(id) {
            CancelOutcome::Cancelled => Ok(true),
            CancelOutcome::Refused => Ok(false),
            CancelOutcome::NotFound => Err(KgError::TaskNotFound(id.to_string())),
        }
    }

    /// Wait until a task reaches a terminal state
    pub async fn wait_for(&self, id: TaskId) -> Result<TaskStatusReport> {
        let mut events = self.shared.events.subscribe();
        loop {
            let report = self.status(id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if let Err(RecvError::Closed) = events.recv().await {
                return self.status(id);
            }
        }
    }

    /// Wait until every submitted task reaches a terminal state
    pub async fn wait_idle(&self) {
        let mut events = self.shared.events.subscribe();
        while !self.shared.registry.active_ids().is_empty() {
            if let Err(RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }

    /// Stream of progress events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    /// Graph as of the most recent merge
    pub fn snapshot(&self) -> Arc<Graph> {
        self.snapshot.borrow().clone()
    }

    pub fn statistics(&self) -> PipelineStatistics {
        let graph = self.snapshot();
        PipelineStatistics {
            class_count: graph.system().class_count(),
            entity_count: graph.entity_count(),
            relationship_count: graph.relationship_count(),
            tasks_by_status: self.shared.registry.counts(),
        }
    }

    /// Persist the latest snapshot
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let graph = self.snapshot();
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || graph.save(path))
            .await
            .map_err(|e| KgError::Persistence(format!("save task failed: {e}")))?
    }

    /// Stop intake, finish or cancel outstanding work, join every worker and
    /// hand back the graph.
    pub async fn shutdown(self, mode: ShutdownMode) -> Result<Graph> {
        let Pipeline {
            shared,
            intake,
            pending,
            snapshot,
            workers,
            merger,
            observer,
            guard,
        } = self;

        tracing::info!(?mode, "pipeline shutting down");
        drop(intake);
        if mode == ShutdownMode::Cancel {
            shared.shutdown.cancel();
        }

        let mut fault = None;
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "extraction worker failed");
                fault = Some(format!("extraction worker failed: {e}"));
            }
        }

        {
            let mut pending = pending.lock().await;
            pending.close();
            while let Ok(job) = pending.try_recv() {
                shared.cancel(job.id);
            }
        }

        let graph = match merger.await {
            Ok(graph) => Some(graph),
            Err(e) => {
                tracing::error!(error = %e, "merge worker failed");
                fault = Some(format!("merge worker failed: {e}"));
                None
            }
        };

        for id in shared.registry.active_ids() {
            tracing::warn!(task_id = %id, "task left unfinished by shutdown");
            shared.fail(id, Stage::Failed, "pipeline stopped before the task finished".to_string());
        }

        guard.disarm();
        drop(snapshot);
        let counts = shared.registry.counts();
        drop(shared);
        if let Some(observer) = observer {
            let _ = observer.await;
        }

        match (fault, graph) {
            (None, Some(graph)) => {
                tracing::info!(?counts, "pipeline stopped");
                Ok(graph)
            }
            (Some(fault), _) => Err(KgError::PipelineHalted(fault)),
            (None, None) => Err(KgError::PipelineHalted("merge worker lost".to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kgraph_core::System;
    use kgraph_extractor::Extraction;

    struct EmptyExtractor;

    #[async_trait]
    impl Extractor for EmptyExtractor {
        async fn extract(&self, _schema: &System, _text: &str) -> Result<Extraction> {
            Ok(Extraction::default())
        }
    }

    fn builder() -> PipelineBuilder {
        Pipeline::builder(Graph::new(System::new()), Arc::new(EmptyExtractor))
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let config = PipelineConfig {
            extraction_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            builder().with_config(config).start(),
            Err(KgError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let pipeline = builder().start().unwrap();
        let id = TaskId::new();
        assert!(matches!(pipeline.status(id), Err(KgError::TaskNotFound(_))));
        assert!(matches!(pipeline.cancel(id), Err(KgError::TaskNotFound(_))));
        pipeline.shutdown(ShutdownMode::Drain).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let pipeline = builder().start().unwrap();
        let id = pipeline.submit("nothing to see").unwrap();

        let report = pipeline.wait_for(id).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(report.finished_at.is_some());

        let stages = pipeline.stage_results(id).unwrap();
        assert!(stages.contains_key(&Stage::SystemUpdate));
        assert!(stages.contains_key(&Stage::Merging));
        assert!(!pipeline.cancel(id).unwrap());

        pipeline.shutdown(ShutdownMode::Drain).await.unwrap();
    }
}
