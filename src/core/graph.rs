//! Explicit resource dependency graph.
//!
//! Assemblers declare every resource together with the ids it must wait for.
//! A dependency can only name a resource that is already declared, so the graph
//! is acyclic by construction and declaration order is a valid creation order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::readiness::ReadinessCondition;
use crate::core::resources::{InstanceSpec, Resource};
use crate::errors::GraphError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    pub resource: Resource,
    pub depends_on: BTreeSet<ResourceId>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResourceGraph {
    order: Vec<ResourceId>,
    nodes: BTreeMap<ResourceId, ResourceNode>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource. Every dependency must already be declared.
    pub fn add<I>(&mut self, id: impl Into<ResourceId>, resource: Resource, depends_on: I) -> Result<ResourceId, GraphError>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateResource(id.to_string()));
        }

        let depends_on: BTreeSet<ResourceId> = depends_on.into_iter().collect();
        if let Some(missing) = depends_on.iter().find(|dep| !self.nodes.contains_key(*dep)) {
            return Err(GraphError::UnknownDependency {
                resource: id.to_string(),
                dependency: missing.to_string(),
            });
        }

        self.order.push(id.clone());
        self.nodes.insert(
            id.clone(),
            ResourceNode {
                id: id.clone(),
                resource,
                depends_on,
            },
        );
        Ok(id)
    }

    pub fn add_root(&mut self, id: impl Into<ResourceId>, resource: Resource) -> Result<ResourceId, GraphError> {
        self.add(id, resource, std::iter::empty::<ResourceId>())
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &ResourceId) -> Result<&ResourceNode, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownResource(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Nodes in declaration order (a valid topological order).
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    pub fn dependencies_of(&self, id: &ResourceId) -> Result<&BTreeSet<ResourceId>, GraphError> {
        self.node(id).map(|n| &n.depends_on)
    }

    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.iter()
            .filter(|n| n.depends_on.contains(id))
            .map(|n| &n.id)
            .collect()
    }

    /// True when `id` cannot start before `ancestor` completed.
    pub fn depends_transitively(&self, id: &ResourceId, ancestor: &ResourceId) -> bool {
        let mut stack: Vec<&ResourceId> = match self.nodes.get(id) {
            Some(node) => node.depends_on.iter().collect(),
            None => return false,
        };
        let mut seen = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == ancestor {
                return true;
            }
            if seen.insert(next) {
                if let Some(node) = self.nodes.get(next) {
                    stack.extend(node.depends_on.iter());
                }
            }
        }
        false
    }

    pub fn readiness_conditions(&self) -> impl Iterator<Item = (&ResourceId, &ReadinessCondition)> {
        self.iter().filter_map(|n| match &n.resource {
            Resource::Readiness(condition) => Some((&n.id, condition)),
            _ => None,
        })
    }

    pub fn instances(&self) -> impl Iterator<Item = (&ResourceId, &InstanceSpec)> {
        self.iter().filter_map(|n| match &n.resource {
            Resource::Instance(spec) => Some((&n.id, spec)),
            _ => None,
        })
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.iter().filter(|n| n.resource.kind() == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resources::NetworkSpec;

    fn network(name: &str) -> Resource {
        Resource::Network(NetworkSpec {
            name: name.to_string(),
            reuse: false,
        })
    }

    #[test]
    fn test_dependencies_must_be_declared_first() {
        let mut graph = ResourceGraph::new();
        let err = graph
            .add("b", network("b"), [ResourceId::from("a")])
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                resource: "b".into(),
                dependency: "a".into()
            }
        );
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add_root("a", network("a")).unwrap();
        assert_eq!(
            graph.add_root("a", network("a")).unwrap_err(),
            GraphError::DuplicateResource("a".into())
        );
    }

    #[test]
    fn test_edges_are_inspectable() {
        let mut graph = ResourceGraph::new();
        let a = graph.add_root("a", network("a")).unwrap();
        let b = graph.add("b", network("b"), [a.clone()]).unwrap();
        let c = graph.add("c", network("c"), [b.clone()]).unwrap();

        assert_eq!(graph.dependents_of(&a), vec![&b]);
        assert!(graph.depends_transitively(&c, &a));
        assert!(!graph.depends_transitively(&a, &c));
        assert_eq!(
            graph.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }
}
