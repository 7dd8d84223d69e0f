//! kgraph Extractor - Candidate extraction and merging
//!
//! Defines the candidate records produced from free-form text, the
//! collaborator traits that produce them ([`Extractor`], [`SchemaAdvisor`]),
//! schema-proposal vetting, and the [`Combiner`](combiner::Combiner) that
//! reconciles candidates into a graph.

use async_trait::async_trait;
use kgraph_core::{PropertyValues, Result, System};
use serde::{Deserialize, Serialize};

pub use combiner::{Combiner, MergeCounts, MergeReport};
pub use proposal::{ClassEnhancement, SchemaChange, SchemaProposal};

/// Candidate class instance for an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateClass {
    pub class_name: String,
    #[serde(default)]
    pub properties: PropertyValues,
}

impl CandidateClass {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: PropertyValues::new(),
        }
    }

    /// Set a property value (builder style)
    pub fn with_value(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(property.into(), Some(value.into()));
        self
    }
}

/// Entity proposed by an extractor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub classes: Vec<CandidateClass>,
}

impl CandidateEntity {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            classes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: CandidateClass) -> Self {
        self.classes.push(class);
        self
    }
}

/// Relationship proposed by an extractor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRelationship {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

impl CandidateRelationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            description: description.into(),
        }
    }
}

/// Output of one extraction call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<CandidateEntity>,
    #[serde(default)]
    pub relationships: Vec<CandidateRelationship>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Proposes candidate entities and relationships from text.
///
/// Failures must be reported as [`KgError::Extraction`](kgraph_core::KgError).
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, schema: &System, text: &str) -> Result<Extraction>;
}

/// Proposes schema extensions from text.
///
/// Proposals may only add classes or add properties to existing classes.
#[async_trait]
pub trait SchemaAdvisor: Send + Sync {
    async fn propose(&self, schema: &System, text: &str) -> Result<SchemaProposal>;
}

pub mod combiner;
pub mod llm;
pub mod llm_extractor;
pub mod proposal;
