//! Declaration-ordered directed acyclic graph.
//!
//! Nodes keep the index at which they were first declared. Topological
//! ordering always picks the ready node with the lowest declaration index,
//! so unrelated nodes come out in declaration order and the result is
//! reproducible across runs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::hash::Hash;

/// A cycle found in the graph, listed in edge order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<K>(pub Vec<K>);

#[derive(Debug, Clone)]
pub struct Dag<K> {
    nodes: Vec<K>,
    index: HashMap<K, usize>,
    /// node -> nodes it depends on
    prerequisites: Vec<BTreeSet<usize>>,
    /// node -> nodes depending on it
    dependents: Vec<BTreeSet<usize>>,
}

impl<K: Clone + Eq + Hash> Default for Dag<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> Dag<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            prerequisites: Vec::new(),
            dependents: Vec::new(),
        }
    }

    /// Add a node, returning its declaration index. Re-adding is a no-op.
    pub fn add_node(&mut self, node: K) -> usize {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(node.clone(), idx);
        self.nodes.push(node);
        self.prerequisites.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        idx
    }

    /// Record that `dependent` requires `prerequisite`. Returns false if
    /// either node is unknown.
    pub fn add_edge(&mut self, dependent: &K, prerequisite: &K) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(dependent), self.index.get(prerequisite))
        else {
            return false;
        };
        self.prerequisites[from].insert(to);
        self.dependents[to].insert(from);
        true
    }

    pub fn contains(&self, node: &K) -> bool {
        self.index.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[K] {
        &self.nodes
    }

    pub fn declaration_index(&self, node: &K) -> Option<usize> {
        self.index.get(node).copied()
    }

    /// Direct prerequisites of `node`, in declaration order.
    pub fn prerequisites(&self, node: &K) -> Vec<&K> {
        self.index
            .get(node)
            .map(|&i| self.prerequisites[i].iter().map(|&p| &self.nodes[p]).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `node`, in declaration order.
    pub fn dependents(&self, node: &K) -> Vec<&K> {
        self.index
            .get(node)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    /// Every node `node` depends on, directly or not.
    pub fn transitive_prerequisites(&self, node: &K) -> Vec<&K> {
        self.closure(node, &self.prerequisites)
    }

    /// Every node depending on `node`, directly or not.
    pub fn transitive_dependents(&self, node: &K) -> Vec<&K> {
        self.closure(node, &self.dependents)
    }

    fn closure(&self, node: &K, edges: &[BTreeSet<usize>]) -> Vec<&K> {
        let Some(&start) = self.index.get(node) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for &next in &edges[current] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.remove(&start);
        seen.into_iter().map(|i| &self.nodes[i]).collect()
    }

    /// Prerequisites-first order, or the cycle that prevents one.
    ///
    /// Never returns a partial order.
    pub fn topological_order(&self) -> Result<Vec<K>, Cycle<K>> {
        let mut remaining: Vec<usize> = self.prerequisites.iter().map(|p| p.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &dependent in &self.dependents[idx] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect());
        }

        let blocked: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|i| remaining[*i] > 0)
            .collect();
        Err(Cycle(
            self.find_cycle(&blocked)
                .into_iter()
                .map(|i| self.nodes[i].clone())
                .collect(),
        ))
    }

    /// Every blocked node has at least one blocked prerequisite, so walking
    /// prerequisites from any blocked node must revisit a node.
    fn find_cycle(&self, blocked: &BTreeSet<usize>) -> Vec<usize> {
        let Some(&start) = blocked.iter().next() else {
            return Vec::new();
        };
        let mut path: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut current = start;

        loop {
            if let Some(&at) = position.get(&current) {
                let mut cycle = path[at..].to_vec();
                cycle.reverse();
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);
            match self.prerequisites[current].iter().find(|p| blocked.contains(*p)) {
                Some(&next) => current = next,
                None => return path,
            }
        }
    }
}
