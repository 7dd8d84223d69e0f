//! Schema proposals
//!
//! A [`SchemaProposal`] describes classes to add and properties to add to
//! existing classes. Proposals are vetted against a System before they are
//! applied: redundant parts are folded or dropped, and anything that would
//! redefine an existing property rejects the whole proposal.

use std::collections::HashMap;

use kgraph_core::{ClassDefinition, PropertyDefinition, Result, System};
use serde::{Deserialize, Serialize};

/// New properties for an existing class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEnhancement {
    pub class_name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl ClassEnhancement {
    pub fn new(class_name: impl Into<String>, properties: Vec<PropertyDefinition>) -> Self {
        Self {
            class_name: class_name.into(),
            properties,
        }
    }
}

/// Schema extension proposed for a piece of text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProposal {
    pub needed: bool,
    #[serde(default)]
    pub added_classes: Vec<ClassDefinition>,
    #[serde(default)]
    pub enhanced_classes: Vec<ClassEnhancement>,
    #[serde(default)]
    pub rationale: String,
}

/// Class names touched by an applied proposal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub added_classes: Vec<String>,
    pub enhanced_classes: Vec<String>,
}

impl SchemaChange {
    pub fn is_empty(&self) -> bool {
        self.added_classes.is_empty() && self.enhanced_classes.is_empty()
    }
}

/// Same property identity: name and constraint flags. Descriptions may differ.
fn same_identity(a: &PropertyDefinition, b: &PropertyDefinition) -> bool {
    a.name == b.name && a.required == b.required && a.value_required == b.value_required
}

/// Fold `incoming` into `planned`, dropping properties already present with
/// the same identity and failing on a differing redefinition.
fn fold_properties(
    class: &str,
    existing: &[PropertyDefinition],
    planned: &mut Vec<PropertyDefinition>,
    incoming: Vec<PropertyDefinition>,
) -> std::result::Result<(), String> {
    for prop in incoming {
        let clash = existing
            .iter()
            .chain(planned.iter())
            .find(|p| p.name == prop.name);
        match clash {
            Some(current) if same_identity(current, &prop) => continue,
            Some(_) => {
                return Err(format!(
                    "property '{}' of class '{}' would be redefined",
                    prop.name, class
                ))
            }
            None => planned.push(prop),
        }
    }
    Ok(())
}

/// Properties new to an existing class are added as optional. Instances
/// created before the enhancement carry no value for them.
fn relax_new_properties(
    class: &ClassDefinition,
    incoming: Vec<PropertyDefinition>,
) -> Vec<PropertyDefinition> {
    incoming
        .into_iter()
        .map(|mut prop| {
            if class.property(&prop.name).is_none() && (prop.required || prop.value_required) {
                tracing::warn!(
                    class = %class.name,
                    property = %prop.name,
                    "new property on existing class added as optional"
                );
                prop.required = false;
                prop.value_required = false;
            }
            prop
        })
        .collect()
}

impl SchemaProposal {
    /// A proposal that changes nothing
    pub fn unchanged(rationale: impl Into<String>) -> Self {
        Self {
            needed: false,
            rationale: rationale.into(),
            ..Default::default()
        }
    }

    /// A proposal adding classes and/or enhancing existing ones
    pub fn extend(
        added_classes: Vec<ClassDefinition>,
        enhanced_classes: Vec<ClassEnhancement>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            needed: true,
            added_classes,
            enhanced_classes,
            rationale: rationale.into(),
        }
    }

    /// True when applying the proposal would change nothing
    pub fn is_empty(&self) -> bool {
        !self.needed
            || (self.added_classes.is_empty()
                && self.enhanced_classes.iter().all(|e| e.properties.is_empty()))
    }

    /// Vet this proposal against `system`.
    ///
    /// An added class that already exists becomes an enhancement, properties
    /// identical to existing ones are dropped, and empty parts are removed.
    /// Properties new to an existing class lose their `required` and
    /// `value_required` flags.
    /// A property redefinition, or an enhancement of a class that is neither
    /// defined nor being added, rejects the whole proposal as not needed.
    pub fn vet(self, system: &System) -> SchemaProposal {
        if !self.needed {
            return Self::unchanged(self.rationale);
        }
        let rationale = self.rationale.clone();
        match self.fold(system) {
            Ok(vetted) => vetted,
            Err(reason) => {
                tracing::warn!(reason = %reason, "schema proposal rejected");
                Self::unchanged(format!("rejected: {reason} ({rationale})"))
            }
        }
    }

    fn fold(self, system: &System) -> std::result::Result<SchemaProposal, String> {
        let mut added: Vec<ClassDefinition> = Vec::new();
        let mut enhanced: Vec<ClassEnhancement> = Vec::new();
        // upper-cased class name -> index into `added` or `enhanced`
        let mut added_index: HashMap<String, usize> = HashMap::new();
        let mut enhanced_index: HashMap<String, usize> = HashMap::new();

        let requests = self
            .added_classes
            .into_iter()
            .map(|c| (c.name.clone(), Some(c.description.clone()), c.properties))
            .chain(
                self.enhanced_classes
                    .into_iter()
                    .map(|e| (e.class_name, None, e.properties)),
            );

        for (name, description, properties) in requests {
            let key = name.trim().to_uppercase();
            if key.is_empty() {
                return Err("class name must not be empty".to_string());
            }

            if let Some(existing) = system.get_class(&name) {
                let idx = *enhanced_index.entry(key).or_insert_with(|| {
                    enhanced.push(ClassEnhancement::new(existing.name.clone(), Vec::new()));
                    enhanced.len() - 1
                });
                fold_properties(
                    &existing.name,
                    &existing.properties,
                    &mut enhanced[idx].properties,
                    relax_new_properties(existing, properties),
                )?;
            } else if let Some(&idx) = added_index.get(&key) {
                let class = &mut added[idx];
                fold_properties(&class.name.clone(), &[], &mut class.properties, properties)?;
            } else if let Some(description) = description {
                let mut class = ClassDefinition::new(name.trim());
                class.description = description;
                fold_properties(name.trim(), &[], &mut class.properties, properties)?;
                added_index.insert(key, added.len());
                added.push(class);
            } else {
                return Err(format!("class '{name}' is not defined"));
            }
        }

        enhanced.retain(|e| !e.properties.is_empty());
        let needed = !added.is_empty() || !enhanced.is_empty();
        Ok(SchemaProposal {
            needed,
            added_classes: added,
            enhanced_classes: enhanced,
            rationale: self.rationale,
        })
    }

    /// Apply a vetted proposal through the System's additive API.
    ///
    /// Either every part applies or the System is left untouched.
    pub fn apply(&self, system: &mut System) -> Result<SchemaChange> {
        let mut change = SchemaChange::default();
        if self.is_empty() {
            return Ok(change);
        }

        let mut next = system.clone();
        for class in &self.added_classes {
            next.add_class(class.clone())?;
            change.added_classes.push(class.name.clone());
        }
        for enhancement in self.enhanced_classes.iter().filter(|e| !e.properties.is_empty()) {
            next.enhance_class(&enhancement.class_name, enhancement.properties.clone())?;
            change.enhanced_classes.push(enhancement.class_name.clone());
        }

        *system = next;
        tracing::info!(
            added = ?change.added_classes,
            enhanced = ?change.enhanced_classes,
            "schema extended"
        );
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> System {
        let mut system = System::new();
        system
            .add_class(
                ClassDefinition::new("App")
                    .with_property(PropertyDefinition::new("vendor"))
                    .with_property(PropertyDefinition::new("category").required()),
            )
            .unwrap();
        system
    }

    #[test]
    fn test_vet_keeps_new_class() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person").with_property(PropertyDefinition::new("age"))],
            vec![],
            "mentions people",
        );

        let vetted = proposal.vet(&system());
        assert!(vetted.needed);
        assert_eq!(vetted.added_classes.len(), 1);
        assert_eq!(vetted.rationale, "mentions people");
    }

    #[test]
    fn test_vet_folds_existing_class_into_enhancement() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("APP")
                .with_property(PropertyDefinition::new("vendor"))
                .with_property(PropertyDefinition::new("rating"))],
            vec![],
            "",
        );

        let vetted = proposal.vet(&system());
        assert!(vetted.needed);
        assert!(vetted.added_classes.is_empty());
        assert_eq!(vetted.enhanced_classes.len(), 1);
        assert_eq!(vetted.enhanced_classes[0].class_name, "App");
        assert_eq!(vetted.enhanced_classes[0].properties.len(), 1);
        assert_eq!(vetted.enhanced_classes[0].properties[0].name, "rating");
    }

    #[test]
    fn test_vet_identical_properties_are_noop() {
        let proposal = SchemaProposal::extend(
            vec![],
            vec![ClassEnhancement::new(
                "app",
                vec![PropertyDefinition::new("vendor").with_description("who makes it")],
            )],
            "",
        );

        let vetted = proposal.vet(&system());
        assert!(!vetted.needed);
        assert!(vetted.is_empty());
    }

    #[test]
    fn test_vet_rejects_narrowing() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person")],
            vec![ClassEnhancement::new(
                "App",
                vec![PropertyDefinition::new("vendor").required().value_required()],
            )],
            "make vendor mandatory",
        );

        let vetted = proposal.vet(&system());
        assert!(!vetted.needed);
        assert!(vetted.added_classes.is_empty());
        assert!(vetted.rationale.contains("vendor"));
    }

    #[test]
    fn test_vet_adds_new_properties_of_existing_class_as_optional() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("App")
                .with_property(PropertyDefinition::new("rating").required().value_required())],
            vec![ClassEnhancement::new(
                "app",
                vec![
                    PropertyDefinition::new("rating").required(),
                    PropertyDefinition::new("category").required(),
                ],
            )],
            "",
        );

        let vetted = proposal.vet(&system());
        assert!(vetted.needed);
        assert_eq!(vetted.enhanced_classes.len(), 1);
        let props = &vetted.enhanced_classes[0].properties;
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].name, "rating");
        assert!(!props[0].required);
        assert!(!props[0].value_required);

        // re-vetting after another worker applied the same enhancement
        let mut extended = system();
        vetted.apply(&mut extended).unwrap();
        let again = vetted.vet(&extended);
        assert!(!again.needed);
        assert!(!again.rationale.starts_with("rejected"));
    }

    #[test]
    fn test_new_class_keeps_required_properties() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person")
                .with_property(PropertyDefinition::new("age").required().value_required())],
            vec![],
            "",
        );

        let vetted = proposal.vet(&system());
        let age = vetted.added_classes[0].property("age").unwrap();
        assert!(age.required && age.value_required);
    }

    #[test]
    fn test_vet_rejects_enhancement_of_unknown_class() {
        let proposal = SchemaProposal::extend(
            vec![],
            vec![ClassEnhancement::new("Planet", vec![PropertyDefinition::new("mass")])],
            "",
        );

        let vetted = proposal.vet(&system());
        assert!(!vetted.needed);
        assert!(vetted.rationale.contains("Planet"));
    }

    #[test]
    fn test_vet_enhancement_of_class_added_in_same_proposal() {
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person")],
            vec![ClassEnhancement::new("person", vec![PropertyDefinition::new("age")])],
            "",
        );

        let vetted = proposal.vet(&system());
        assert_eq!(vetted.added_classes.len(), 1);
        assert_eq!(vetted.added_classes[0].property_names(), vec!["age"]);
        assert!(vetted.enhanced_classes.is_empty());
    }

    #[test]
    fn test_apply() {
        let mut system = system();
        let before = system.clone();
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person")],
            vec![ClassEnhancement::new("App", vec![PropertyDefinition::new("rating")])],
            "",
        )
        .vet(&system);

        let change = proposal.apply(&mut system).unwrap();
        assert_eq!(change.added_classes, vec!["Person"]);
        assert_eq!(change.enhanced_classes, vec!["App"]);
        assert!(system.extends(&before));
        assert!(system.get_class("App").unwrap().property("rating").is_some());
    }

    #[test]
    fn test_apply_unvetted_collision_leaves_system_untouched() {
        let mut system = system();
        let before = system.clone();
        let proposal = SchemaProposal::extend(
            vec![ClassDefinition::new("Person")],
            vec![ClassEnhancement::new("App", vec![PropertyDefinition::new("vendor")])],
            "",
        );

        assert!(proposal.apply(&mut system).is_err());
        assert_eq!(system, before);
    }

    #[test]
    fn test_not_needed_proposal_applies_nothing() {
        let mut system = system();
        let change = SchemaProposal::unchanged("SUFFICIENT").apply(&mut system).unwrap();
        assert!(change.is_empty());
    }
}
