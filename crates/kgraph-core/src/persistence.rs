//! Graph snapshot persistence
//!
//! A snapshot is a versioned JSON document holding the System, entities and
//! relationships. Loading re-validates every record against the restored
//! System, so a hand-edited file cannot produce an invalid graph.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Relationship};
use crate::graph::Graph;
use crate::schema::System;
use crate::{KgError, Result};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub system: System,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    /// Capture a graph
    pub fn capture(graph: &Graph) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            system: graph.system().clone(),
            entities: graph.entities().into_iter().cloned().collect(),
            relationships: graph.relationships().into_iter().cloned().collect(),
        }
    }

    /// Rebuild a graph, validating every entity and relationship
    pub fn restore(self) -> Result<Graph> {
        if self.version != SNAPSHOT_VERSION {
            return Err(KgError::Persistence(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }

        let mut graph = Graph::new(self.system);
        for entity in self.entities {
            graph.add_entity(entity)?;
        }
        for rel in self.relationships {
            if rel.count == 0 {
                return Err(KgError::Persistence(format!(
                    "relationship {} -> {} has zero count",
                    rel.source, rel.target
                )));
            }
            graph.restore_relationship(rel)?;
        }
        Ok(graph)
    }
}

impl Graph {
    /// Write a JSON snapshot to `path`.
    ///
    /// The file is written beside the target and renamed into place.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&GraphSnapshot::capture(self))
            .map_err(|e| KgError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| KgError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| KgError::Persistence(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| KgError::Persistence(format!("{}: {e}", path.display())))?;

        tracing::info!(
            path = %path.display(),
            entities = self.entity_count(),
            relationships = self.relationship_count(),
            "graph saved"
        );
        Ok(())
    }

    /// Load a graph from a JSON snapshot
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| KgError::Persistence(format!("{}: {e}", path.display())))?;
        let snapshot: GraphSnapshot = serde_json::from_str(&content)
            .map_err(|e| KgError::Persistence(format!("{}: {e}", path.display())))?;
        snapshot.restore()
    }
}
