//! Dependency graph over tasks.
//!
//! Built from `(task, depends_on)` pairs and validated with Kahn's algorithm.
//! Used both when a task is added (existing tasks plus the candidate) and by
//! `TaskGraph::validate` over the persisted graph.

use std::collections::{BTreeMap, BTreeSet};

use foreman_common::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    UnknownDependency { task: TaskId, dependency: TaskId },
    /// Closed path, first node repeated at the end (`T03 -> T05 -> T03`).
    Cycle(Vec<TaskId>),
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// task -> tasks it depends on
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
    /// task -> tasks that depend on it
    forward_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    /// Build and validate the graph.
    pub fn build<'a, I>(nodes: I) -> Result<Self, DagError>
    where
        I: IntoIterator<Item = (TaskId, &'a BTreeSet<TaskId>)>,
    {
        let mut graph = Self::default();
        for (task, deps) in nodes {
            graph.reverse_edges.insert(task, deps.clone());
            graph.forward_edges.entry(task).or_default();
        }

        for (&task, deps) in &graph.reverse_edges {
            for &dep in deps {
                if !graph.forward_edges.contains_key(&dep) {
                    return Err(DagError::UnknownDependency {
                        task,
                        dependency: dep,
                    });
                }
            }
        }
        let edges: Vec<(TaskId, TaskId)> = graph
            .reverse_edges
            .iter()
            .flat_map(|(&task, deps)| deps.iter().map(move |&dep| (dep, task)))
            .collect();
        for (from, to) in edges {
            graph.forward_edges.entry(from).or_default().insert(to);
        }

        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.reverse_edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse_edges.is_empty()
    }

    pub fn dependencies(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.reverse_edges.get(&task).into_iter().flatten().copied()
    }

    pub fn dependents(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.forward_edges.get(&task).into_iter().flatten().copied()
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<TaskId> {
        self.reverse_edges
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(&task, _)| task)
            .collect()
    }

    /// Every task reachable by following dependents from `task`.
    pub fn downstream(&self, task: TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<TaskId> = self.dependents(task).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Kahn's algorithm. On failure, report one concrete cycle.
    fn validate_no_cycles(&self) -> Result<(), DagError> {
        let mut in_degree: BTreeMap<TaskId, usize> = self
            .reverse_edges
            .iter()
            .map(|(&task, deps)| (task, deps.len()))
            .collect();

        let mut queue: Vec<TaskId> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(&task, _)| task)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for dependent in self.dependents(node) {
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(dependent);
                    }
                }
            }
        }

        if processed == self.len() {
            return Ok(());
        }

        let remaining: BTreeSet<TaskId> = in_degree
            .into_iter()
            .filter(|&(_, deg)| deg > 0)
            .map(|(task, _)| task)
            .collect();
        Err(DagError::Cycle(self.extract_cycle(&remaining)))
    }

    /// Walk dependency edges inside the unprocessed set until a node repeats.
    /// Every unprocessed node has at least one unprocessed dependency, so the
    /// walk always closes.
    fn extract_cycle(&self, remaining: &BTreeSet<TaskId>) -> Vec<TaskId> {
        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        loop {
            let next = self
                .dependencies(current)
                .find(|dep| remaining.contains(dep));
            let Some(next) = next else {
                return path;
            };
            if let Some(pos) = path.iter().position(|&t| t == next) {
                let mut cycle = path.split_off(pos);
                cycle.push(next);
                return cycle;
            }
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u32) -> TaskId {
        TaskId::new(n)
    }

    fn deps(ids: &[u32]) -> BTreeSet<TaskId> {
        ids.iter().map(|&n| t(n)).collect()
    }

    #[test]
    fn linear_chain_is_valid() {
        let nodes = [(t(1), deps(&[])), (t(2), deps(&[1])), (t(3), deps(&[2]))];
        let graph = DependencyGraph::build(nodes.iter().map(|(id, d)| (*id, d))).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots(), vec![t(1)]);
        assert_eq!(graph.dependents(t(1)).collect::<Vec<_>>(), vec![t(2)]);
        assert_eq!(graph.downstream(t(1)), deps(&[2, 3]));
    }

    #[test]
    fn diamond_is_valid() {
        let nodes = [
            (t(1), deps(&[])),
            (t(2), deps(&[1])),
            (t(3), deps(&[1])),
            (t(4), deps(&[2, 3])),
        ];
        let graph = DependencyGraph::build(nodes.iter().map(|(id, d)| (*id, d))).unwrap();
        assert_eq!(graph.dependencies(t(4)).collect::<Vec<_>>(), vec![t(2), t(3)]);
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let nodes = [(t(1), deps(&[9]))];
        let err = DependencyGraph::build(nodes.iter().map(|(id, d)| (*id, d))).unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownDependency {
                task: t(1),
                dependency: t(9)
            }
        );
    }

    #[test]
    fn cycle_is_named() {
        let nodes = [
            (t(1), deps(&[])),
            (t(3), deps(&[1, 5])),
            (t(5), deps(&[3])),
        ];
        let err = DependencyGraph::build(nodes.iter().map(|(id, d)| (*id, d))).unwrap_err();
        match err {
            DagError::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&t(3)) && path.contains(&t(5)));
                assert!(!path.contains(&t(1)));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let nodes = [(t(2), deps(&[2]))];
        let err = DependencyGraph::build(nodes.iter().map(|(id, d)| (*id, d))).unwrap_err();
        assert_eq!(err, DagError::Cycle(vec![t(2), t(2)]));
    }
}
