//! Schema registry
//!
//! A [`System`] holds the class definitions a graph is governed by, plus the
//! seed entities a fresh graph may be populated with. The registry is
//! additive-only: classes can be added and enhanced with new properties, but
//! never removed, and an existing property is never redefined.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::entity::{has_value, ClassInstance, PropertyValues};
use crate::{KgError, Result};

// ============================================================================
// Definitions
// ============================================================================

/// Property definition for a class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Property name, unique within its class
    pub name: String,

    /// Must be present on every instance of the class
    #[serde(default)]
    pub required: bool,

    /// If present, must carry a non-empty value
    #[serde(default)]
    pub value_required: bool,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyDefinition {
    /// Create an optional property with no constraints
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            value_required: false,
            description: None,
        }
    }

    /// Mark the property as required on every instance
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Require a non-empty value whenever the property is present
    pub fn value_required(mut self) -> Self {
        self.value_required = true;
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Class definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDefinition {
    /// Class name, unique (case-insensitively) within a System
    pub name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Ordered property definitions
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl ClassDefinition {
    /// Create a class with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            properties: Vec::new(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a property definition
    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    /// Look up a property by name
    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Names of all defined properties
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name.as_str()).collect()
    }

    /// Check candidate property values against this definition.
    ///
    /// Every supplied property must be defined on the class, and every
    /// `value_required` property must be present with a non-empty value.
    pub fn check_values(&self, entity: &str, values: &PropertyValues) -> Result<()> {
        let unknown: Vec<&str> = values
            .keys()
            .filter(|name| self.property(name).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(KgError::SchemaViolation(format!(
                "entity '{}': class '{}' does not define properties {:?} (defined: {:?})",
                entity,
                self.name,
                unknown,
                self.property_names()
            )));
        }

        let missing: Vec<&str> = self
            .properties
            .iter()
            .filter(|p| p.value_required)
            .filter(|p| !has_value(values.get(&p.name).and_then(|v| v.as_deref())))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(KgError::SchemaViolation(format!(
                "entity '{}': class '{}' requires values for {:?}",
                entity, self.name, missing
            )));
        }

        Ok(())
    }

    /// Validate values and build a class instance.
    ///
    /// Required properties absent from `values` are inserted unset.
    pub fn instantiate(&self, entity: &str, values: &PropertyValues) -> Result<ClassInstance> {
        self.check_values(entity, values)?;

        let mut instance = ClassInstance::new(&self.name);
        for (name, value) in values {
            instance.properties.insert(name.clone(), value.clone());
        }
        for prop in self.properties.iter().filter(|p| p.required) {
            instance.properties.entry(prop.name.clone()).or_insert(None);
        }
        Ok(instance)
    }

    fn ensure_unique_properties(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for prop in &self.properties {
            if !seen.insert(prop.name.as_str()) {
                return Err(KgError::DuplicateProperty {
                    class: self.name.clone(),
                    property: prop.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Seed entity descriptor carried by a System
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub classes: Vec<String>,
}

impl SeedEntity {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            classes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }
}

/// How candidate values are merged into an existing class instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Only unset values are filled in; a stored value is never replaced
    #[default]
    FillMissing,
    /// A set candidate value replaces the stored value
    Overwrite,
}

// ============================================================================
// System
// ============================================================================

/// Schema registry: class definitions and seed entities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SystemRepr", into = "SystemRepr")]
pub struct System {
    /// Keyed by upper-cased class name
    classes: BTreeMap<String, ClassDefinition>,
    seed_entities: Vec<SeedEntity>,
}

fn class_key(name: &str) -> String {
    name.trim().to_uppercase()
}

impl System {
    /// Create an empty System
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a System from class definitions and seed entities
    pub fn from_parts(classes: Vec<ClassDefinition>, seed_entities: Vec<SeedEntity>) -> Result<Self> {
        let mut system = Self::new();
        for class in classes {
            system.add_class(class)?;
        }
        system.seed_entities = seed_entities;
        Ok(system)
    }

    /// Look up a class definition (case-insensitive)
    pub fn get_class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes.get(&class_key(name))
    }

    /// Check whether a class is defined
    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains_key(&class_key(name))
    }

    /// Add a new class definition
    pub fn add_class(&mut self, class: ClassDefinition) -> Result<()> {
        let key = class_key(&class.name);
        if key.is_empty() {
            return Err(KgError::SchemaViolation(
                "class name must not be empty".to_string(),
            ));
        }
        if self.classes.contains_key(&key) {
            return Err(KgError::DuplicateClass(class.name));
        }
        class.ensure_unique_properties()?;

        tracing::debug!(class = %class.name, properties = class.properties.len(), "class added");
        self.classes.insert(key, class);
        Ok(())
    }

    /// Add new properties to an existing class.
    ///
    /// Fails without modifying anything if any property name collides with an
    /// existing property or with another property in the same batch.
    pub fn enhance_class(&mut self, name: &str, properties: Vec<PropertyDefinition>) -> Result<()> {
        let class = self
            .classes
            .get_mut(&class_key(name))
            .ok_or_else(|| KgError::SchemaViolation(format!("class '{name}' is not defined")))?;

        let mut seen: HashSet<&str> = class.properties.iter().map(|p| p.name.as_str()).collect();
        for prop in &properties {
            if !seen.insert(prop.name.as_str()) {
                return Err(KgError::DuplicateProperty {
                    class: class.name.clone(),
                    property: prop.name.clone(),
                });
            }
        }

        tracing::debug!(class = %class.name, added = properties.len(), "class enhanced");
        class.properties.extend(properties);
        Ok(())
    }

    /// All class definitions, ordered by case-insensitive name
    pub fn classes(&self) -> impl Iterator<Item = &ClassDefinition> {
        self.classes.values()
    }

    /// Class names in their original spelling
    pub fn class_names(&self) -> Vec<String> {
        self.classes.values().map(|c| c.name.clone()).collect()
    }

    /// Number of defined classes
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Seed entity descriptors
    pub fn seed_entities(&self) -> &[SeedEntity] {
        &self.seed_entities
    }

    /// Register a seed entity descriptor
    pub fn add_seed_entity(&mut self, seed: SeedEntity) {
        self.seed_entities.push(seed);
    }

    /// True when this System contains every class of `earlier`, each with at
    /// least the same properties.
    pub fn extends(&self, earlier: &System) -> bool {
        earlier.classes().all(|old| match self.get_class(&old.name) {
            Some(new) => old
                .properties
                .iter()
                .all(|p| new.property(&p.name) == Some(p)),
            None => false,
        })
    }
}

/// Serialized form of a System
#[derive(Serialize, Deserialize)]
struct SystemRepr {
    #[serde(default)]
    classes: Vec<ClassDefinition>,
    #[serde(default)]
    seed_entities: Vec<SeedEntity>,
}

impl TryFrom<SystemRepr> for System {
    type Error = KgError;

    fn try_from(repr: SystemRepr) -> Result<Self> {
        System::from_parts(repr.classes, repr.seed_entities)
    }
}

impl From<System> for SystemRepr {
    fn from(system: System) -> Self {
        Self {
            classes: system.classes.into_values().collect(),
            seed_entities: system.seed_entities,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
