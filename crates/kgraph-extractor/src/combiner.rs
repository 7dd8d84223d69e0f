//! Candidate merging
//!
//! The [`Combiner`] reconciles an [`Extraction`] into a [`Graph`]. Entities
//! are merged first so relationships can resolve against them. In the
//! default mode a failed item is counted and skipped; in strict mode the
//! first failure aborts the rest of the batch.

use kgraph_core::entity::has_value;
use kgraph_core::{Graph, KgError, MergePolicy, PropertyValues, Result, UpsertOutcome};
use serde::{Deserialize, Serialize};

use crate::{CandidateClass, CandidateEntity, CandidateRelationship, Extraction};

/// Added/updated/failed counters for one kind of item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub added: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Outcome of merging one extraction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub entities: MergeCounts,
    pub relationships: MergeCounts,
    /// Reasons for failed items, in merge order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

enum EntityOutcome {
    Added,
    Updated,
}

/// Merges candidates into a graph
#[derive(Debug, Clone, Copy, Default)]
pub struct Combiner {
    strict: bool,
    policy: MergePolicy,
}

impl Combiner {
    /// Skip-and-continue combiner with the fill-missing policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the batch on the first failed item
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Merge an extraction into `graph`.
    ///
    /// Returns [`KgError::Merge`] only in strict mode; items merged before
    /// the failing one stay merged.
    pub fn combine(&self, graph: &mut Graph, extraction: &Extraction) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        for candidate in &extraction.entities {
            match self.merge_entity(graph, candidate) {
                Ok(EntityOutcome::Added) => report.entities.added += 1,
                Ok(EntityOutcome::Updated) => report.entities.updated += 1,
                Err(e) => {
                    let reason = format!("entity '{}': {e}", candidate.name);
                    self.record_failure(&mut report, reason, |r| &mut r.entities)?;
                }
            }
        }

        for candidate in &extraction.relationships {
            match Self::merge_relationship(graph, candidate) {
                Ok(UpsertOutcome::Added) => report.relationships.added += 1,
                Ok(UpsertOutcome::Updated) => report.relationships.updated += 1,
                Err(e) => {
                    let reason = format!(
                        "relationship '{}' -> '{}': {e}",
                        candidate.source, candidate.target
                    );
                    self.record_failure(&mut report, reason, |r| &mut r.relationships)?;
                }
            }
        }

        tracing::info!(
            entities_added = report.entities.added,
            entities_updated = report.entities.updated,
            entities_failed = report.entities.failed,
            relationships_added = report.relationships.added,
            relationships_updated = report.relationships.updated,
            relationships_failed = report.relationships.failed,
            "candidates merged"
        );
        Ok(report)
    }

    fn record_failure(
        &self,
        report: &mut MergeReport,
        reason: String,
        counts: impl Fn(&mut MergeReport) -> &mut MergeCounts,
    ) -> Result<()> {
        if self.strict {
            return Err(KgError::Merge(reason));
        }
        tracing::warn!(reason = %reason, "merge item failed");
        counts(report).failed += 1;
        report.failures.push(reason);
        Ok(())
    }

    fn merge_entity(&self, graph: &mut Graph, candidate: &CandidateEntity) -> Result<EntityOutcome> {
        let classes = coalesce_classes(&candidate.classes);

        let Some(existing) = graph.get_entity(&candidate.name) else {
            graph.create_entity(
                &candidate.name,
                &candidate.description,
                classes
                    .into_iter()
                    .map(|c| (c.class_name, c.properties))
                    .collect(),
            )?;
            tracing::debug!(entity = %candidate.name, "entity added");
            return Ok(EntityOutcome::Added);
        };
        let name = existing.name.clone();

        // Validate every class before touching the entity
        let mut new_classes = Vec::new();
        let mut known_classes = Vec::new();
        for class in classes {
            let definition = graph.system().get_class(&class.class_name).ok_or_else(|| {
                KgError::SchemaViolation(format!("class '{}' is not defined", class.class_name))
            })?;
            if existing.has_class(&class.class_name) {
                if let Some(unknown) = class.properties.keys().find(|p| definition.property(p).is_none()) {
                    return Err(KgError::SchemaViolation(format!(
                        "class '{}' does not define property '{}'",
                        definition.name, unknown
                    )));
                }
                known_classes.push(class);
            } else {
                definition.check_values(&name, &class.properties)?;
                new_classes.push(class);
            }
        }

        for class in new_classes {
            graph.add_class_to_entity(&name, &class.class_name, class.properties)?;
        }
        for class in known_classes {
            graph.merge_properties(&name, &class.class_name, &class.properties, self.policy)?;
        }
        graph.merge_description(&name, &candidate.description, self.policy)?;

        tracing::debug!(entity = %name, "entity updated");
        Ok(EntityOutcome::Updated)
    }

    fn merge_relationship(graph: &mut Graph, candidate: &CandidateRelationship) -> Result<UpsertOutcome> {
        for endpoint in [&candidate.source, &candidate.target] {
            if graph.resolve_node(endpoint).is_none() {
                return Err(KgError::SchemaViolation(format!(
                    "endpoint '{endpoint}' does not resolve"
                )));
            }
        }
        graph.upsert_relationship(&candidate.source, &candidate.target, &candidate.description)
    }
}

/// Merge repeated classes of one candidate (case-insensitive), keeping the
/// first set value for each property
fn coalesce_classes(classes: &[CandidateClass]) -> Vec<CandidateClass> {
    let mut out: Vec<CandidateClass> = Vec::new();
    for class in classes {
        let key = class.class_name.trim().to_uppercase();
        match out.iter_mut().find(|c| c.class_name.trim().to_uppercase() == key) {
            Some(current) => merge_values(&mut current.properties, &class.properties),
            None => out.push(class.clone()),
        }
    }
    out
}

fn merge_values(into: &mut PropertyValues, from: &PropertyValues) {
    for (name, value) in from {
        let slot = into.entry(name.clone()).or_insert(None);
        if !has_value(slot.as_deref()) {
            *slot = value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::{ClassDefinition, PropertyDefinition, System};

    fn graph() -> Graph {
        let mut system = System::new();
        system
            .add_class(
                ClassDefinition::new("Person")
                    .with_property(PropertyDefinition::new("city"))
                    .with_property(PropertyDefinition::new("age")),
            )
            .unwrap();
        system
            .add_class(
                ClassDefinition::new("App")
                    .with_property(PropertyDefinition::new("category").value_required()),
            )
            .unwrap();
        Graph::new(system)
    }

    fn person(name: &str, city: &str) -> CandidateEntity {
        CandidateEntity::new(name, "").with_class(CandidateClass::new("Person").with_value("city", city))
    }

    #[test]
    fn test_combine_adds_entities_and_relationships() {
        let mut graph = graph();
        let extraction = Extraction {
            entities: vec![person("A", "Paris"), person("B", "Rome")],
            relationships: vec![CandidateRelationship::new("A", "B", "uses")],
        };

        let report = Combiner::new().combine(&mut graph, &extraction).unwrap();
        assert_eq!(report.entities, MergeCounts { added: 2, updated: 0, failed: 0 });
        assert_eq!(report.relationships.added, 1);
        assert_eq!(graph.entity_count(), 2);
    }

    #[test]
    fn test_combine_twice_updates_and_counts() {
        let mut graph = graph();
        let extraction = Extraction {
            entities: vec![person("A", "Paris"), person("B", "Rome")],
            relationships: vec![CandidateRelationship::new("A", "B", "uses")],
        };
        let combiner = Combiner::new();
        combiner.combine(&mut graph, &extraction).unwrap();
        let report = combiner.combine(&mut graph, &extraction).unwrap();

        assert_eq!(report.entities.updated, 2);
        assert_eq!(report.relationships.updated, 1);
        assert_eq!(graph.relationship_count(), 1);
        assert_eq!(graph.get_relationship("A", "B", "uses").unwrap().count, 2);
    }

    #[test]
    fn test_existing_value_not_overwritten() {
        let mut graph = graph();
        let combiner = Combiner::new();
        combiner
            .combine(&mut graph, &Extraction { entities: vec![person("A", "Paris")], ..Default::default() })
            .unwrap();

        let second = CandidateEntity::new("a", "").with_class(
            CandidateClass::new("person").with_value("city", "Berlin").with_value("age", "30"),
        );
        combiner
            .combine(&mut graph, &Extraction { entities: vec![second], ..Default::default() })
            .unwrap();

        let a = graph.get_entity("A").unwrap();
        assert_eq!(a.property_value("Person", "city"), Some("Paris"));
        assert_eq!(a.property_value("Person", "age"), Some("30"));
    }

    #[test]
    fn test_overwrite_policy() {
        let mut graph = graph();
        let combiner = Combiner::new().with_policy(MergePolicy::Overwrite);
        combiner
            .combine(&mut graph, &Extraction { entities: vec![person("A", "Paris")], ..Default::default() })
            .unwrap();
        combiner
            .combine(&mut graph, &Extraction { entities: vec![person("A", "Berlin")], ..Default::default() })
            .unwrap();

        assert_eq!(
            graph.get_entity("A").unwrap().property_value("Person", "city"),
            Some("Berlin")
        );
    }

    #[test]
    fn test_unknown_class_fails_item_only() {
        let mut graph = graph();
        let extraction = Extraction {
            entities: vec![
                person("A", "Paris"),
                CandidateEntity::new("Mars", "").with_class(CandidateClass::new("Planet")),
                person("B", "Rome"),
            ],
            relationships: vec![],
        };

        let report = Combiner::new().combine(&mut graph, &extraction).unwrap();
        assert_eq!(report.entities, MergeCounts { added: 2, updated: 0, failed: 1 });
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("Mars"));
        assert!(graph.get_entity("Mars").is_none());
    }

    #[test]
    fn test_existing_entity_new_class_validated_before_changes() {
        let mut graph = graph();
        let combiner = Combiner::new();
        combiner
            .combine(&mut graph, &Extraction { entities: vec![person("A", "Paris")], ..Default::default() })
            .unwrap();

        // App requires a category value; nothing about A may change
        let candidate = CandidateEntity::new("A", "now described")
            .with_class(CandidateClass::new("App"))
            .with_class(CandidateClass::new("Person").with_value("age", "40"));
        let report = combiner
            .combine(&mut graph, &Extraction { entities: vec![candidate], ..Default::default() })
            .unwrap();

        assert_eq!(report.entities.failed, 1);
        let a = graph.get_entity("A").unwrap();
        assert!(!a.has_class("App"));
        assert_eq!(a.property_value("Person", "age"), None);
        assert_eq!(a.description, "");
    }

    #[test]
    fn test_existing_entity_gains_class() {
        let mut graph = graph();
        let combiner = Combiner::new();
        combiner
            .combine(&mut graph, &Extraction { entities: vec![person("A", "Paris")], ..Default::default() })
            .unwrap();

        let candidate = CandidateEntity::new("A", "")
            .with_class(CandidateClass::new("App").with_value("category", "tools"));
        let report = combiner
            .combine(&mut graph, &Extraction { entities: vec![candidate], ..Default::default() })
            .unwrap();

        assert_eq!(report.entities.updated, 1);
        assert!(graph.get_entity("A").unwrap().has_class("App"));
    }

    #[test]
    fn test_unresolved_relationship_endpoint_fails() {
        let mut graph = graph();
        let extraction = Extraction {
            entities: vec![person("A", "Paris")],
            relationships: vec![
                CandidateRelationship::new("A", "Ghost", "knows"),
                CandidateRelationship::new("A", "A:Person", "is"),
                CandidateRelationship::new("A:Person", "Person", "instance of"),
            ],
        };

        let report = Combiner::new().combine(&mut graph, &extraction).unwrap();
        assert_eq!(report.relationships, MergeCounts { added: 2, updated: 0, failed: 1 });
    }

    #[test]
    fn test_strict_mode_aborts_on_first_failure() {
        let mut graph = graph();
        let extraction = Extraction {
            entities: vec![
                person("A", "Paris"),
                CandidateEntity::new("Mars", "").with_class(CandidateClass::new("Planet")),
                person("B", "Rome"),
            ],
            relationships: vec![],
        };

        let err = Combiner::new().strict(true).combine(&mut graph, &extraction).unwrap_err();
        assert!(matches!(err, KgError::Merge(msg) if msg.contains("Mars")));
        assert!(graph.get_entity("A").is_some());
        assert!(graph.get_entity("B").is_none());
    }

    #[test]
    fn test_repeated_candidate_classes_are_coalesced() {
        let mut graph = graph();
        let candidate = CandidateEntity::new("A", "")
            .with_class(CandidateClass::new("Person").with_value("city", "Paris"))
            .with_class(CandidateClass::new("PERSON").with_value("age", "30"));

        let report = Combiner::new()
            .combine(&mut graph, &Extraction { entities: vec![candidate], ..Default::default() })
            .unwrap();

        assert_eq!(report.entities.added, 1);
        let a = graph.get_entity("A").unwrap();
        assert_eq!(a.classes.len(), 1);
        assert_eq!(a.property_value("Person", "age"), Some("30"));
    }
}
