//! TaskGraph - 接続成分のスナップショット
//!
//! A read-only view of a connected component, built from one transaction's
//! reads. Edges point from dependant to dependency. Install checks it for
//! cycles and milestone reachability; the rollback planner walks it in both
//! directions and orders wave members with it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::{astar, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};

use crate::domain::Task;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    tasks: BTreeMap<String, Task>,
}

impl TaskGraph {
    /// Build from task snapshots. Edges to tasks outside `tasks` are
    /// dropped.
    pub fn build(tasks: BTreeMap<String, Task>) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(tasks.len());
        for name in tasks.keys() {
            index.insert(name.clone(), graph.add_node(name.clone()));
        }
        for (name, task) in &tasks {
            for dependency in &task.dependencies {
                if let (Some(&from), Some(&to)) = (index.get(name), index.get(dependency)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self {
            graph,
            index,
            tasks,
        }
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// `start` and everything that transitively depends on it, in BFS order.
    pub fn dependants_closure(&self, start: &str) -> Vec<String> {
        let Some(&root) = self.index.get(start) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, root);
        let mut out = Vec::new();
        while let Some(nx) = bfs.next(reversed) {
            out.push(self.graph[nx].clone());
        }
        out
    }

    /// `start` and everything it transitively depends on, in BFS order.
    pub fn dependencies_closure(&self, start: &str) -> Vec<String> {
        let Some(&root) = self.index.get(start) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, root);
        let mut out = Vec::new();
        while let Some(nx) = bfs.next(&self.graph) {
            out.push(self.graph[nx].clone());
        }
        out
    }

    /// First cycle found, as the path `a -> b -> ... -> a` along dependency
    /// edges; `None` for a DAG.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let start = toposort(&self.graph, None).err()?.node_id();
        // shortest way back to `start` through one of its dependencies
        let back = self.graph.neighbors(start).find_map(|next| {
            astar(&self.graph, next, |n| n == start, |_| 1usize, |_| 0).map(|(_, path)| path)
        })?;

        let mut cycle = vec![self.graph[start].clone()];
        cycle.extend(back.into_iter().map(|n| self.graph[n].clone()));
        Some(cycle)
    }

    /// Kahn's algorithm over the subgraph induced by `subset`, dependencies
    /// before dependants. Ties break by name so the order is reproducible.
    pub fn topological_order(&self, subset: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        for name in subset {
            let idx = self.node(name)?;
            let inside = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .filter(|dep| subset.contains(&self.graph[*dep]))
                .count();
            pending.insert(name.as_str(), inside);
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(subset.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            let idx = self.node(name)?;
            for dependant in self.graph.neighbors_directed(idx, Direction::Incoming) {
                let dependant = self.graph[dependant].as_str();
                if let Some(left) = pending.get_mut(dependant) {
                    *left = left.saturating_sub(1);
                    if *left == 0 {
                        ready.insert(dependant);
                    }
                }
            }
        }

        if order.len() != subset.len() {
            let cycle = pending
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(EngineError::CycleDetected { cycle });
        }
        Ok(order)
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::Internal(format!("{name} is not part of the graph")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `edges` are (dependant, dependency).
    fn graph(names: &[&str], edges: &[(&str, &str)]) -> TaskGraph {
        let mut tasks: BTreeMap<String, Task> = names
            .iter()
            .map(|n| (n.to_string(), Task::new(*n)))
            .collect();
        for (dependant, dependency) in edges {
            if let Some(t) = tasks.get_mut(*dependant) {
                t.dependencies.insert(dependency.to_string());
            }
            if let Some(t) = tasks.get_mut(*dependency) {
                t.dependants.insert(dependant.to_string());
            }
        }
        TaskGraph::build(tasks)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn closures_follow_edge_direction() {
        // m <- a <- b, m <- c
        let g = graph(&["m", "a", "b", "c"], &[("a", "m"), ("b", "a"), ("c", "m")]);

        let down: BTreeSet<String> = g.dependants_closure("m").into_iter().collect();
        assert_eq!(down, set(&["m", "a", "b", "c"]));
        assert_eq!(g.dependants_closure("b"), vec!["b"]);

        let up: BTreeSet<String> = g.dependencies_closure("b").into_iter().collect();
        assert_eq!(up, set(&["b", "a", "m"]));
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let g = graph(
            &["m", "a", "b", "c"],
            &[("a", "m"), ("b", "a"), ("c", "m"), ("b", "c")],
        );
        let order = g.topological_order(&set(&["m", "a", "b", "c"])).unwrap();
        assert_eq!(order, vec!["m", "a", "c", "b"]);
    }

    #[test]
    fn topological_order_ignores_edges_leaving_the_subset() {
        let g = graph(&["x", "a", "b"], &[("a", "x"), ("b", "a")]);
        let order = g.topological_order(&set(&["a", "b"])).unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn topological_order_reports_cycles() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let err = g.topological_order(&set(&["a", "b"])).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
    }

    #[test]
    fn two_task_cycle_is_found() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn longer_cycle_leaves_the_tail_out() {
        // b -> c -> d -> b, plus a tail to a
        let g = graph(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "b"), ("d", "c"), ("b", "d")],
        );
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&"a".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&["a"], &[("a", "a")]);
        assert_eq!(g.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn crossing_paths_are_not_a_cycle() {
        //     a
        //    / \
        //   b   c
        //   |\ /|
        //   | X |
        //   |/ \|
        //   d   e
        let g = graph(
            &["a", "b", "c", "d", "e"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("e", "b"), ("d", "c"), ("e", "c")],
        );
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn unknown_start_yields_nothing() {
        let g = graph(&["a"], &[]);
        assert!(g.dependants_closure("zzz").is_empty());
        assert!(g.topological_order(&set(&["zzz"])).is_err());
    }
}
