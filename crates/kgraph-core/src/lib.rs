//! kgraph Core - Schema registry, graph model, and shared types
//!
//! This crate defines the core abstractions used throughout kgraph:
//! - Schema models (classes, properties, seed entities)
//! - Knowledge graph model (entities, class instances, relationships)
//! - Derived node views and traversal
//! - Snapshot persistence
//! - Common error types
//! - Configuration management

pub mod config;
pub mod entity;
pub mod graph;
pub mod persistence;
pub mod schema;
pub mod traversal;

pub use config::{
    AppConfig, ConfigError, LlmConfig, LlmProvider, LoggingConfig, PipelineConfig, SchemaSeed,
    StorageConfig,
};
pub use entity::{ClassInstance, Entity, PropertyValues, Relationship, RelationshipKey};
pub use graph::{Graph, GraphStats, NodeRef, UpsertOutcome};
pub use persistence::{GraphSnapshot, SNAPSHOT_VERSION};
pub use schema::{ClassDefinition, MergePolicy, PropertyDefinition, SeedEntity, System};
pub use traversal::{EdgeKind, NodeGraph};

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for kgraph operations
#[derive(Error, Debug)]
pub enum KgError {
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Entity already exists: {0}")]
    DuplicateEntity(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Class already exists: {0}")]
    DuplicateClass(String),

    #[error("Property '{property}' already defined on class '{class}'")]
    DuplicateProperty { class: String, property: String },

    #[error("Entity '{entity}' already has class '{class}'")]
    Idempotency { entity: String, class: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Pipeline is not accepting tasks")]
    PipelineStopped,

    #[error("Pipeline halted: {0}")]
    PipelineHalted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KgError>;

// ============================================================================
// Traits
// ============================================================================

/// Trait for LLM clients backing the reasoning collaborators
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for the prompt
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Client name for logging
    fn name(&self) -> &str {
        "llm"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait::async_trait]
    impl LlmClient for EchoClient {
        async fn generate(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_uppercase())
        }
    }

    #[test]
    fn test_llm_client_trait_object() {
        let client: Box<dyn LlmClient> = Box::new(EchoClient);
        let out = tokio_test::block_on(client.generate("abc")).unwrap();
        assert_eq!(out, "ABC");
        assert_eq!(client.name(), "llm");
    }

    #[test]
    fn test_error_messages() {
        let err = KgError::DuplicateProperty {
            class: "App".to_string(),
            property: "vendor".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Property 'vendor' already defined on class 'App'"
        );

        let err = KgError::Idempotency {
            entity: "A".to_string(),
            class: "Tool".to_string(),
        };
        assert!(err.to_string().contains("already has class"));
    }
}
