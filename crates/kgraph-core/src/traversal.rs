//! Graph traversal over stored and derived nodes
//!
//! Builds a petgraph view of a [`Graph`]: entities, class nodes and class
//! masters as vertices, with structural edges linking each entity to its
//! class nodes and each class node to its class master, plus one edge per
//! recorded relationship.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeRef};

/// Edge label in a [`NodeGraph`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    /// Entity to one of its class nodes
    HasClass,
    /// Class node to its class master
    InstanceOf,
    /// Recorded relationship
    Relationship { description: String, count: u64 },
}

/// Directed petgraph view of a graph
pub struct NodeGraph {
    graph: DiGraph<NodeRef, EdgeKind>,
    /// Keyed by upper-cased node id
    index: HashMap<String, NodeIndex>,
}

impl NodeGraph {
    fn insert(&mut self, node: NodeRef) -> NodeIndex {
        let key = node.id().to_uppercase();
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(node);
        self.index.insert(key, idx);
        idx
    }

    /// Node by id (case-insensitive)
    pub fn node(&self, id: &str) -> Option<&NodeRef> {
        self.index.get(&id.to_uppercase()).map(|&i| &self.graph[i])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Outgoing edges of a node as `(target, kind)` pairs
    pub fn outgoing(&self, id: &str) -> Vec<(&NodeRef, &EdgeKind)> {
        let Some(&idx) = self.index.get(&id.to_uppercase()) else {
            return Vec::new();
        };
        let mut edges: Vec<(&NodeRef, &EdgeKind)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (&self.graph[e.target()], e.weight()))
            .collect();
        edges.sort_by(|a, b| a.0.cmp(b.0));
        edges
    }

    /// Nodes reachable from `id` within `depth` hops, ignoring edge direction.
    ///
    /// The start node is included. Results are ordered by distance, then by
    /// node.
    pub fn neighbourhood(&self, id: &str, depth: usize) -> Vec<NodeRef> {
        let Some(&start) = self.index.get(&id.to_uppercase()) else {
            return Vec::new();
        };

        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut found: Vec<(usize, &NodeRef)> = Vec::new();

        while let Some((idx, dist)) = queue.pop_front() {
            found.push((dist, &self.graph[idx]));
            if dist == depth {
                continue;
            }
            for next in self.graph.neighbors_undirected(idx) {
                if seen.insert(next) {
                    queue.push_back((next, dist + 1));
                }
            }
        }

        found.sort();
        found.into_iter().map(|(_, n)| n.clone()).collect()
    }
}

impl Graph {
    /// Build the traversal view of this graph
    pub fn node_graph(&self) -> NodeGraph {
        let mut view = NodeGraph {
            graph: DiGraph::new(),
            index: HashMap::new(),
        };

        for master in self.class_master_nodes() {
            view.insert(master);
        }

        for entity in self.entities() {
            let entity_idx = view.insert(NodeRef::Entity {
                name: entity.name.clone(),
            });
            for instance in &entity.classes {
                let class_idx = view.insert(NodeRef::ClassNode {
                    entity: entity.name.clone(),
                    class: instance.class_name.clone(),
                });
                view.graph.add_edge(entity_idx, class_idx, EdgeKind::HasClass);

                if let Some(master) = self.system().get_class(&instance.class_name) {
                    let master_idx = view.insert(NodeRef::ClassMaster {
                        class: master.name.clone(),
                    });
                    view.graph.add_edge(class_idx, master_idx, EdgeKind::InstanceOf);
                }
            }
        }

        for rel in self.relationships() {
            let (Some(source), Some(target)) =
                (self.resolve_node(&rel.source), self.resolve_node(&rel.target))
            else {
                continue;
            };
            let s = view.insert(source);
            let t = view.insert(target);
            view.graph.add_edge(
                s,
                t,
                EdgeKind::Relationship {
                    description: rel.description.clone(),
                    count: rel.count,
                },
            );
        }

        view
    }

    /// Nodes within `depth` hops of the node `id`
    pub fn neighbourhood(&self, id: &str, depth: usize) -> Vec<NodeRef> {
        self.node_graph().neighbourhood(id, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PropertyValues;
    use crate::schema::{ClassDefinition, System};

    fn sample_graph() -> Graph {
        let mut system = System::new();
        system.add_class(ClassDefinition::new("Person")).unwrap();
        system.add_class(ClassDefinition::new("Tool")).unwrap();

        let mut graph = Graph::new(system);
        graph
            .create_entity("Alice", "", vec![("Person".to_string(), PropertyValues::new())])
            .unwrap();
        graph
            .create_entity("Hammer", "", vec![("Tool".to_string(), PropertyValues::new())])
            .unwrap();
        graph.create_entity("Carol", "", vec![]).unwrap();
        graph.upsert_relationship("Alice", "Hammer", "uses").unwrap();
        graph.upsert_relationship("Alice", "Hammer", "uses").unwrap();
        graph
    }

    #[test]
    fn test_node_graph_shape() {
        let view = sample_graph().node_graph();

        // 2 masters + 3 entities + 2 class nodes
        assert_eq!(view.node_count(), 7);
        // 2 has_class + 2 instance_of + 1 relationship
        assert_eq!(view.edge_count(), 5);

        let out = view.outgoing("alice");
        assert!(out.iter().any(|(n, k)| n.id() == "Hammer"
            && **k
                == EdgeKind::Relationship {
                    description: "uses".to_string(),
                    count: 2
                }));
        assert!(out.iter().any(|(n, k)| n.id() == "Alice:Person" && **k == EdgeKind::HasClass));
    }

    #[test]
    fn test_neighbourhood_depth() {
        let graph = sample_graph();

        let zero = graph.neighbourhood("Alice", 0);
        assert_eq!(zero.len(), 1);

        let one: Vec<String> = graph.neighbourhood("Alice", 1).iter().map(NodeRef::id).collect();
        assert_eq!(one[0], "Alice");
        assert!(one.contains(&"Hammer".to_string()));
        assert!(one.contains(&"Alice:Person".to_string()));
        assert!(!one.contains(&"Person".to_string()));

        let two: Vec<String> = graph.neighbourhood("Alice", 2).iter().map(NodeRef::id).collect();
        assert!(two.contains(&"Person".to_string()));
        assert!(two.contains(&"Hammer:Tool".to_string()));
        assert!(!two.contains(&"Carol".to_string()));
    }

    #[test]
    fn test_neighbourhood_unknown_node() {
        assert!(sample_graph().neighbourhood("Nobody", 3).is_empty());
    }
}
