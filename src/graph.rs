//! DAG operations over an arena of nodes identified by index: topological
//! sort, reachability, and incremental ready-set computation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected among nodes {0:?}")]
    Cycle(Vec<usize>),
}

/// A dependency DAG over `0..n` node indices. Edges point from a node to its
/// dependencies (predecessors); successors are derived.
pub struct Graph {
    deps: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
}

impl Graph {
    pub fn new(deps: Vec<Vec<usize>>) -> Self {
        let n = deps.len();
        let mut succs = vec![Vec::new(); n];
        for (node, d) in deps.iter().enumerate() {
            for &dep in d {
                succs[dep].push(node);
            }
        }
        Self { deps, succs }
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn predecessors(&self, node: usize) -> &[usize] {
        &self.deps[node]
    }

    pub fn successors(&self, node: usize) -> &[usize] {
        &self.succs[node]
    }

    /// All transitive descendants of `node`, not including itself.
    pub fn descendants(&self, node: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack = vec![node];
        let mut out = Vec::new();
        seen[node] = true;
        while let Some(n) = stack.pop() {
            for &s in &self.succs[n] {
                if !seen[s] {
                    seen[s] = true;
                    out.push(s);
                    stack.push(s);
                }
            }
        }
        out
    }

    /// A stable topological order. Errors if the graph has a cycle (callers
    /// normally validate acyclicity at freeze time, so this is a defensive
    /// check here).
    pub fn toposort(&self) -> Result<Vec<usize>, GraphError> {
        let order = toposort_indices(self.deps.clone());
        if order.len() != self.len() {
            let missing: Vec<usize> = (0..self.len()).filter(|i| !order.contains(i)).collect();
            return Err(GraphError::Cycle(missing));
        }
        Ok(order)
    }

    /// Given a predicate `is_terminal(node)` and `result_ok(node, dep)` (does
    /// `node`'s dependency-result predicate accept `dep`'s terminal status),
    /// return the set of currently-non-terminal nodes whose dependencies are
    /// all terminal — split into those that satisfy their result predicates
    /// (truly ready) and those that don't (should be skipped/not_run).
    pub fn ready<F, G>(&self, is_terminal: F, result_ok: G) -> (Vec<usize>, Vec<usize>)
    where
        F: Fn(usize) -> bool,
        G: Fn(usize, usize) -> bool,
    {
        let mut ready = Vec::new();
        let mut gated = Vec::new();
        for node in 0..self.len() {
            if is_terminal(node) {
                continue;
            }
            if self.deps[node].iter().all(|&d| is_terminal(d)) {
                if self.deps[node].iter().all(|&d| result_ok(node, d)) {
                    ready.push(node);
                } else {
                    gated.push(node);
                }
            }
        }
        (ready, gated)
    }
}

/// Kahn's algorithm producing dependencies-before-dependents order.
/// Returns nodes in an arbitrary but stable (ascending-index-tiebreak) order
/// among equally-ready nodes. Used by spec freezing, where acyclicity has
/// already been checked by Tarjan's SCC, so a residual cycle here is a bug.
pub fn toposort_indices(deps: Vec<Vec<usize>>) -> Vec<usize> {
    let n = deps.len();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (node, d) in deps.iter().enumerate() {
        indegree[node] = d.len();
        for &dep in d {
            succs[dep].push(node);
        }
    }

    let mut queue: std::collections::BinaryHeap<std::cmp::Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(std::cmp::Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(std::cmp::Reverse(node)) = queue.pop() {
        order.push(node);
        for &s in &succs[node] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                queue.push(std::cmp::Reverse(s));
            }
        }
    }

    order
}
