//! "Must be ready before" edges between resources.
//!
//! The graph is built once per run from the declarations and never mutated.
//! Topological order uses Kahn's algorithm; among nodes whose dependencies
//! are all placed, the one declared first goes next, so startup order and
//! logs are reproducible.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use orchard_core::ResourceDecl;

use crate::error::{BootstrapError, BootstrapResult};

/// Immutable DAG of resource nodes.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Declarations in declaration order.
    nodes: Vec<ResourceDecl>,
    index: HashMap<String, usize>,
    /// Direct dependencies per node (deduplicated, declaration order).
    deps: Vec<Vec<usize>>,
    /// Direct dependents per node.
    dependents: Vec<Vec<usize>>,
    /// Topological order as node indices.
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph, or fail with `CycleDetected` naming the cycle.
    pub fn build(decls: &[ResourceDecl]) -> BootstrapResult<Self> {
        let mut index = HashMap::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            if index.insert(decl.name.clone(), i).is_some() {
                return Err(BootstrapError::DuplicateNode(decl.name.clone()));
            }
        }

        let mut deps = vec![Vec::new(); decls.len()];
        let mut dependents = vec![Vec::new(); decls.len()];
        for (i, decl) in decls.iter().enumerate() {
            for dep in &decl.depends_on {
                let j = *index
                    .get(dep)
                    .ok_or_else(|| BootstrapError::UnknownDependency {
                        node: decl.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        let mut graph = Self {
            nodes: decls.to_vec(),
            index,
            deps,
            dependents,
            order: Vec::with_capacity(decls.len()),
        };
        graph.order = graph.topological_order()?;
        Ok(graph)
    }

    fn topological_order(&self) -> BootstrapResult<Vec<usize>> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(BootstrapError::CycleDetected {
                cycle: self.find_cycle(&remaining),
            })
        }
    }

    /// Walk unplaced nodes along their unplaced dependencies until one repeats.
    ///
    /// Every unplaced node has at least one unplaced dependency, so the walk
    /// always closes a cycle.
    fn find_cycle(&self, remaining: &[usize]) -> Vec<String> {
        let unplaced = |i: usize| remaining[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| unplaced(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.deps[current].iter().find(|&&d| unplaced(d)) else {
                return path.iter().map(|&i| self.nodes[i].name.clone()).collect();
            };
            if let Some(pos) = path.iter().position(|&i| i == next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].name.clone())
                    .collect();
                cycle.push(self.nodes[next].name.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }
    }

    /// Declarations in topological order.
    pub fn order(&self) -> impl Iterator<Item = &ResourceDecl> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    pub fn order_names(&self) -> Vec<&str> {
        self.order().map(|d| d.name.as_str()).collect()
    }

    pub fn node(&self, name: &str) -> Option<&ResourceDecl> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn direct_dependencies(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => self.deps[i]
                .iter()
                .map(|&d| self.nodes[d].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every node that depends on `name`, directly or not, in topological order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&root) = self.index.get(name) else {
            return Vec::new();
        };
        let mut reached = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if !reached[d] {
                    reached[d] = true;
                    stack.push(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|&&i| reached[i])
            .map(|&i| self.nodes[i].name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_core::ResourceKind;

    fn node(name: &str, deps: &[&str]) -> ResourceDecl {
        let mut decl = ResourceDecl::new(name, ResourceKind::EngineInstance);
        decl.depends_on = deps.iter().map(|d| d.to_string()).collect();
        decl
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|n| *n == name).unwrap()
    }

    #[test]
    fn every_node_after_its_dependencies() {
        let decls = vec![
            node("app-db", &["engine"]),
            node("container", &["storage"]),
            node("engine", &[]),
            node("storage", &[]),
            node("cache", &["engine", "storage"]),
            node("reports", &["app-db", "cache"]),
        ];
        let graph = DependencyGraph::build(&decls).unwrap();
        let order = graph.order_names();
        assert_eq!(order.len(), decls.len());

        for decl in &decls {
            for dep in &decl.depends_on {
                assert!(
                    position(&order, dep) < position(&order, &decl.name),
                    "{dep} must come before {}",
                    decl.name
                );
            }
        }
    }

    #[test]
    fn ties_follow_declaration_order() {
        let decls = vec![
            node("engine", &[]),
            node("db", &["engine"]),
            node("storage", &[]),
            node("container", &["storage"]),
            node("admin-password", &[]),
        ];
        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(
            graph.order_names(),
            vec!["engine", "db", "storage", "container", "admin-password"]
        );
    }

    #[test]
    fn order_is_stable_across_builds() {
        let decls = vec![node("c", &[]), node("b", &[]), node("a", &["c"])];
        let first = DependencyGraph::build(&decls).unwrap();
        let second = DependencyGraph::build(&decls).unwrap();
        assert_eq!(first.order_names(), second.order_names());
        assert_eq!(first.order_names(), vec!["c", "b", "a"]);
    }

    #[test]
    fn cycle_is_named() {
        let decls = vec![
            node("root", &[]),
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b", "root"]),
        ];
        match DependencyGraph::build(&decls) {
            Err(BootstrapError::CycleDetected { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|n| n == name));
                }
                assert!(!cycle.iter().any(|n| n == "root"));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let decls = vec![node("loop", &["loop"])];
        match DependencyGraph::build(&decls) {
            Err(BootstrapError::CycleDetected { cycle }) => {
                assert_eq!(cycle, vec!["loop", "loop"]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_rejected() {
        let decls = vec![node("db", &["engine"])];
        assert!(matches!(
            DependencyGraph::build(&decls),
            Err(BootstrapError::UnknownDependency { node, dependency })
                if node == "db" && dependency == "engine"
        ));
    }

    #[test]
    fn duplicate_node_rejected() {
        let decls = vec![node("engine", &[]), node("engine", &[])];
        assert!(matches!(
            DependencyGraph::build(&decls),
            Err(BootstrapError::DuplicateNode(name)) if name == "engine"
        ));
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let decls = vec![node("engine", &[]), node("db", &["engine", "engine"])];
        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(graph.order_names(), vec!["engine", "db"]);
        assert_eq!(graph.direct_dependencies("db"), vec!["engine"]);
    }

    #[test]
    fn transitive_dependents_in_order() {
        let decls = vec![
            node("engine", &[]),
            node("db", &["engine"]),
            node("reports", &["db"]),
            node("storage", &[]),
        ];
        let graph = DependencyGraph::build(&decls).unwrap();
        assert_eq!(graph.transitive_dependents("engine"), vec!["db", "reports"]);
        assert!(graph.transitive_dependents("storage").is_empty());
        assert!(graph.transitive_dependents("missing").is_empty());
    }

    #[test]
    fn empty_graph() {
        let graph = DependencyGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.order_names().is_empty());
    }
}
