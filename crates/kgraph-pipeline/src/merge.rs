//! Merge worker
//!
//! The single consumer of the merge queue and the only writer of the graph.
//! Jobs are applied strictly in queue order. After each merge an immutable
//! snapshot is published for readers before the task is marked finished.

use std::sync::Arc;

use kgraph_core::Graph;
use kgraph_extractor::{Combiner, SchemaChange};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::task::Stage;
use crate::worker::MergeJob;
use crate::Shared;

pub(crate) struct MergeWorker {
    pub shared: Arc<Shared>,
    pub queue: mpsc::UnboundedReceiver<MergeJob>,
    pub graph: Graph,
    pub snapshot_tx: watch::Sender<Arc<Graph>>,
    pub combiner: Combiner,
}

impl MergeWorker {
    /// Drain the merge queue and return the final graph once every sender is
    /// gone
    pub(crate) async fn run(mut self) -> Graph {
        tracing::debug!("merge worker started");

        while let Some(job) = self.queue.recv().await {
            if self.shared.shutdown.is_cancelled() {
                self.shared.cancel(job.id);
                continue;
            }
            self.merge(job);
        }

        tracing::debug!("merge worker stopped");
        self.graph
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.graph.clone()));
    }

    /// Apply one job
    fn merge(&mut self, job: MergeJob) {
        let id = job.id;
        if !self.shared.begin_merge(id) {
            tracing::debug!(task_id = %id, "skipping cancelled task");
            return;
        }

        let mut schema_change = SchemaChange::default();
        if let Some(proposal) = job.proposal {
            let vetted = proposal.vet(self.graph.system());
            match vetted.apply(self.graph.system_mut()) {
                Ok(change) => schema_change = change,
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "schema update failed");
                    self.shared.fail(id, Stage::MergeFailed, e.to_string());
                    return;
                }
            }
        }

        let outcome = self.combiner.combine(&mut self.graph, &job.extraction);
        self.publish_snapshot();
        match outcome {
            Ok(report) => {
                let result = json!({ "schema_change": schema_change, "report": report });
                self.shared.complete(id, result);
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "merge aborted");
                self.shared.fail(id, Stage::MergeFailed, e.to_string());
            }
        }
    }
}
