//! Knowledge graph records
//!
//! Entities, their class instances, and count-aggregated relationships.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Property name to optional value
pub type PropertyValues = BTreeMap<String, Option<String>>;

/// True when a property value is present and not blank
pub fn has_value(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

// ============================================================================
// Class Instance
// ============================================================================

/// Association of one entity to one class, with property values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInstance {
    pub class_name: String,
    #[serde(default)]
    pub properties: PropertyValues,
}

impl ClassInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: PropertyValues::new(),
        }
    }

    /// Value of a property, if present and set
    pub fn value(&self, property: &str) -> Option<&str> {
        self.properties.get(property).and_then(|v| v.as_deref())
    }

    fn matches(&self, class_name: &str) -> bool {
        self.class_name.to_uppercase() == class_name.trim().to_uppercase()
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A named node in the knowledge graph.
///
/// Entities are owned by a [`Graph`](crate::Graph); every mutation after
/// registration goes through the graph so that class instances stay valid
/// against its System.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique name (case-insensitive key)
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// One instance per class, unique by class name
    #[serde(default)]
    pub classes: Vec<ClassInstance>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity with no classes
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            classes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a class instance (builder style, for entities not yet in a graph)
    pub fn with_class(mut self, instance: ClassInstance) -> Self {
        self.classes.push(instance);
        self
    }

    /// Check whether the entity instantiates a class
    pub fn has_class(&self, class_name: &str) -> bool {
        self.class_instance(class_name).is_some()
    }

    /// Class instance by class name (case-insensitive)
    pub fn class_instance(&self, class_name: &str) -> Option<&ClassInstance> {
        self.classes.iter().find(|c| c.matches(class_name))
    }

    pub(crate) fn class_instance_mut(&mut self, class_name: &str) -> Option<&mut ClassInstance> {
        self.classes.iter_mut().find(|c| c.matches(class_name))
    }

    /// Class names in insertion order
    pub fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.class_name.as_str()).collect()
    }

    /// Value of a property under a class
    pub fn property_value(&self, class_name: &str, property: &str) -> Option<&str> {
        self.class_instance(class_name)
            .and_then(|c| c.value(property))
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Relationship
// ============================================================================

/// Identity of a relationship: endpoints compared case-insensitively,
/// description compared exactly
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    source: String,
    target: String,
    description: String,
}

impl RelationshipKey {
    pub fn new(source: &str, target: &str, description: &str) -> Self {
        Self {
            source: source.to_uppercase(),
            target: target.to_uppercase(),
            description: description.to_string(),
        }
    }
}

/// Directed, described, count-aggregated edge between graph nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Source node id
    pub source: String,

    /// Target node id
    pub target: String,

    pub description: String,

    /// Number of times this relationship has been merged
    pub count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    /// Create a relationship observed once
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            source: source.into(),
            target: target.into(),
            description: description.into(),
            count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(&self.source, &self.target, &self.description)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_value() {
        assert!(has_value(Some("x")));
        assert!(!has_value(Some("   ")));
        assert!(!has_value(Some("")));
        assert!(!has_value(None));
    }

    #[test]
    fn test_entity_class_lookup_ignores_case() {
        let mut instance = ClassInstance::new("App");
        instance
            .properties
            .insert("vendor".to_string(), Some("Acme".to_string()));
        let entity = Entity::new("WeChat", "messaging").with_class(instance);

        assert!(entity.has_class("app"));
        assert_eq!(entity.property_value("APP", "vendor"), Some("Acme"));
        assert_eq!(entity.property_value("App", "missing"), None);
        assert_eq!(entity.class_names(), vec!["App"]);
    }

    #[test]
    fn test_relationship_key() {
        let a = Relationship::new("Alice", "Bob", "knows");
        let b = Relationship::new("ALICE", "bob", "knows");
        let c = Relationship::new("Alice", "Bob", "likes");

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.count, 1);
    }
}
