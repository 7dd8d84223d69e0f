//! Extraction workers
//!
//! Each worker pulls pending jobs from the shared intake queue and runs the
//! schema proposal and extraction against a private copy of the current
//! schema. Workers never touch the live graph; their output goes to the
//! merge queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kgraph_core::{Graph, Result, System};
use kgraph_extractor::{Extraction, Extractor, SchemaAdvisor, SchemaProposal};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};

use crate::task::{Stage, TaskId};
use crate::Shared;

/// Submitted text waiting for a worker
pub(crate) struct PendingJob {
    pub id: TaskId,
    pub text: String,
}

/// Extraction output waiting for the merge worker
pub(crate) struct MergeJob {
    pub id: TaskId,
    pub proposal: Option<SchemaProposal>,
    pub extraction: Extraction,
}

pub(crate) struct ExtractionWorker {
    pub worker_id: usize,
    pub shared: Arc<Shared>,
    pub pending: Arc<Mutex<mpsc::UnboundedReceiver<PendingJob>>>,
    pub merge_tx: mpsc::UnboundedSender<MergeJob>,
    pub snapshot: watch::Receiver<Arc<Graph>>,
    pub extractor: Arc<dyn Extractor>,
    pub advisor: Option<Arc<dyn SchemaAdvisor>>,
}

impl ExtractionWorker {
    pub(crate) async fn run(self) {
        tracing::debug!(worker = self.worker_id, "extraction worker started");

        while let Some(job) = self.next_job().await {
            let id = job.id;
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => {
                    self.shared.cancel(id);
                }
                outcome = AssertUnwindSafe(self.process(job)).catch_unwind() => {
                    if let Err(panic) = outcome {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(
                            worker = self.worker_id,
                            task_id = %id,
                            panic = %message,
                            "extraction panicked"
                        );
                        self.shared
                            .fail(id, Stage::Failed, format!("extraction panicked: {message}"));
                    }
                }
            }
        }

        tracing::debug!(worker = self.worker_id, "extraction worker stopped");
    }

    async fn next_job(&self) -> Option<PendingJob> {
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => None,
            job = async { self.pending.lock().await.recv().await } => job,
        }
    }

    async fn process(&self, job: PendingJob) {
        let id = job.id;
        if !self.shared.registry.start(id) {
            tracing::debug!(task_id = %id, "task cancelled before pickup");
            return;
        }
        if !self.shared.advance(
            id,
            Stage::Started,
            format!("picked up by worker {}", self.worker_id),
            Value::Null,
        ) {
            return;
        }

        let mut schema = self.snapshot.borrow().system().clone();

        let (proposal, summary) = match self.propose(&mut schema, &job.text).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "schema proposal failed");
                self.shared.fail(id, Stage::Failed, e.to_string());
                return;
            }
        };
        if !self.shared.advance(id, Stage::SystemUpdate, "schema checked", summary) {
            return;
        }

        if !self.shared.advance(id, Stage::Extraction, "extracting", Value::Null) {
            return;
        }
        let extraction = match self.extractor.extract(&schema, &job.text).await {
            Ok(extraction) => extraction,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "extraction failed");
                self.shared.fail(id, Stage::Failed, e.to_string());
                return;
            }
        };

        let message = format!(
            "{} entities, {} relationships",
            extraction.entities.len(),
            extraction.relationships.len()
        );
        let result = serde_json::to_value(&extraction).unwrap_or(Value::Null);
        // Last cancellation point before the candidates are queued
        if !self.shared.advance(id, Stage::ExtractionCompleted, message, result) {
            return;
        }

        let job = MergeJob {
            id,
            proposal,
            extraction,
        };
        if self.merge_tx.send(job).is_err() {
            tracing::error!(task_id = %id, "merge queue closed, halting pipeline");
            self.shared.fail(id, Stage::MergeFailed, "merge queue closed".to_string());
            self.shared.shutdown.cancel();
        }
    }

    /// Ask the advisor for a schema extension and apply it to the worker's
    /// private schema copy
    async fn propose(
        &self,
        schema: &mut System,
        text: &str,
    ) -> Result<(Option<SchemaProposal>, Value)> {
        let Some(advisor) = &self.advisor else {
            return Ok((
                None,
                json!({ "needed": false, "rationale": "schema evolution disabled" }),
            ));
        };

        let proposal = advisor.propose(schema, text).await?.vet(schema);
        let change = proposal.apply(schema)?;
        let summary = json!({
            "needed": proposal.needed,
            "rationale": proposal.rationale,
            "added_classes": change.added_classes,
            "enhanced_classes": change.enhanced_classes,
        });

        Ok((proposal.needed.then_some(proposal), summary))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
