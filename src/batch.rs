//! Pure partitioning of a case DAG into batches for the batch scheduler.
//! No I/O: `partition` is a deterministic function of its inputs so it can
//! be exercised with ordinary unit and property tests.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many bins a group's cases are split into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchSize {
    Duration(Duration),
    Count(u32),
    CountAuto,
    CountMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    Flat,
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nodes {
    Any,
    Same,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub size: BatchSize,
    pub layout: Layout,
    pub nodes: Nodes,
}

impl Default for BatchSpec {
    fn default() -> Self {
        Self {
            size: BatchSize::CountAuto,
            layout: Layout::Flat,
            nodes: Nodes::Any,
        }
    }
}

const FLAT_AUTO_DURATION: Duration = Duration::from_secs(30 * 60);

/// A partitioning unit: indices into the caller's case slice, plus the
/// node count required to run the batch (the max over its members).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub members: Vec<usize>,
    pub node_count: u32,
}

/// Input the batcher needs per case: its index-local id, runtime
/// estimate, dependency indices (into the same slice), and per-case
/// node-count requirement.
pub struct CaseInput {
    pub runtime_estimate: Duration,
    pub dependencies: Vec<usize>,
    pub node_count: u32,
}

/// Partition `cases` according to `spec`. Every case appears in exactly
/// one batch; a batch's sub-DAG (edges among its own members) is
/// acyclic because the input DAG is acyclic; inter-batch edges form a DAG
/// over the returned batches (by construction — batch index order
/// respects a topological order of the input).
pub fn partition(cases: &[CaseInput], spec: &BatchSpec) -> Vec<Batch> {
    if cases.is_empty() {
        return Vec::new();
    }

    let groups = group_by_node_count(cases, spec.nodes);

    let mut batches = Vec::new();
    for group in groups {
        batches.extend(partition_group(cases, &group, spec));
    }
    batches
}

fn group_by_node_count(cases: &[CaseInput], nodes: Nodes) -> Vec<Vec<usize>> {
    match nodes {
        Nodes::Any => vec![(0..cases.len()).collect()],
        Nodes::Same => {
            let mut by_count: HashMap<u32, Vec<usize>> = HashMap::new();
            for (i, case) in cases.iter().enumerate() {
                by_count.entry(case.node_count).or_default().push(i);
            }
            let mut keys: Vec<u32> = by_count.keys().copied().collect();
            keys.sort();
            keys.into_iter().map(|k| by_count.remove(&k).unwrap()).collect()
        }
    }
}

fn partition_group(cases: &[CaseInput], group: &[usize], spec: &BatchSpec) -> Vec<Batch> {
    let mut ordered: Vec<usize> = group.to_vec();
    ordered.sort_by(|&a, &b| cases[b].runtime_estimate.cmp(&cases[a].runtime_estimate));

    let mut bins: Vec<Vec<usize>> = match &spec.size {
        BatchSize::CountMax => ordered.iter().map(|&i| vec![i]).collect(),
        BatchSize::Count(n) => longest_processing_time(cases, &ordered, (*n).max(1) as usize),
        BatchSize::Duration(limit) => greedy_fill(cases, &ordered, *limit),
        BatchSize::CountAuto => match spec.layout {
            Layout::Atomic => connected_components(cases, &ordered),
            Layout::Flat => greedy_fill(cases, &ordered, FLAT_AUTO_DURATION),
        },
    };

    if spec.layout == Layout::Atomic {
        grow_to_include_ancestors(cases, &mut bins);
    }

    bins.into_iter()
        .filter(|b| !b.is_empty())
        .map(|members| {
            let node_count = members.iter().map(|&i| cases[i].node_count).max().unwrap_or(1);
            Batch { members, node_count }
        })
        .collect()
}

/// Longest-processing-time-first bin-packing: `ordered` is already
/// sorted by descending runtime; assign each case to the currently
/// lightest bin.
fn longest_processing_time(cases: &[CaseInput], ordered: &[usize], n: usize) -> Vec<Vec<usize>> {
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut totals = vec![Duration::ZERO; n];
    for &i in ordered {
        let (lightest, _) = totals
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| **t)
            .unwrap();
        bins[lightest].push(i);
        totals[lightest] += cases[i].runtime_estimate;
    }
    bins
}

fn greedy_fill(cases: &[CaseInput], ordered: &[usize], limit: Duration) -> Vec<Vec<usize>> {
    let mut bins: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_total = Duration::ZERO;

    for &i in ordered {
        let estimate = cases[i].runtime_estimate;
        if !current.is_empty() && current_total + estimate > limit {
            bins.push(std::mem::take(&mut current));
            current_total = Duration::ZERO;
        }
        current_total += estimate;
        current.push(i);
    }
    if !current.is_empty() {
        bins.push(current);
    }
    bins
}

/// One batch per weakly-connected component of the dependency graph
/// restricted to `ordered`.
fn connected_components(cases: &[CaseInput], ordered: &[usize]) -> Vec<Vec<usize>> {
    let members: std::collections::HashSet<usize> = ordered.iter().copied().collect();
    let mut undirected: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in ordered {
        for &d in &cases[i].dependencies {
            if members.contains(&d) {
                undirected.entry(i).or_default().push(d);
                undirected.entry(d).or_default().push(i);
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut components = Vec::new();
    for &start in ordered {
        if seen.contains(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        seen.insert(start);
        while let Some(n) = stack.pop() {
            component.push(n);
            for &neighbor in undirected.get(&n).into_iter().flatten() {
                if seen.insert(neighbor) {
                    stack.push(neighbor);
                }
            }
        }
        components.push(component);
    }
    components
}

/// For `atomic` layout: ensure every member's ancestors are in the same
/// batch by merging bins that share a dependency edge.
fn grow_to_include_ancestors(cases: &[CaseInput], bins: &mut Vec<Vec<usize>>) {
    let mut owner: HashMap<usize, usize> = HashMap::new();
    for (b, members) in bins.iter().enumerate() {
        for &m in members {
            owner.insert(m, b);
        }
    }

    loop {
        let mut merge: Option<(usize, usize)> = None;
        'outer: for (b, members) in bins.iter().enumerate() {
            for &m in members {
                for &d in &cases[m].dependencies {
                    if let Some(&other) = owner.get(&d)
                        && other != b
                    {
                        merge = Some((b.min(other), b.max(other)));
                        break 'outer;
                    }
                }
            }
        }
        let Some((keep, drop)) = merge else { break };
        let moved = std::mem::take(&mut bins[drop]);
        for &m in &moved {
            owner.insert(m, keep);
        }
        bins[keep].extend(moved);
    }
}
