//! Dependency-first install ordering.
//!
//! Cycles, missing dependencies and failures inherited from a failed
//! dependency are reported per shard; everything else is installed with its
//! dependencies strictly first. Ties among independent shards keep discovery
//! order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Why a shard was left out of the install order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderFailure {
    /// A declared dependency is not loaded at all
    Missing { missing: String },
    /// The shard is part of a dependency cycle, listed starting and ending with itself
    Cycle { cycle: Vec<String> },
    /// A declared dependency is known but failed, or was itself left out
    DependencyFailed { dependency: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    /// Shard ids, dependencies first
    pub order: Vec<String>,
    /// Excluded shards, in discovery order
    pub failures: Vec<(String, OrderFailure)>,
}

struct Graph<'a> {
    ids: Vec<&'a str>,
    edges: Vec<Vec<usize>>,
    unknown: Vec<Vec<&'a str>>,
}

/// Computes the install order of `nodes`.
///
/// # Arguments
///
/// * `nodes` - `(shard id, declared dependency ids)` in discovery order
/// * `failed_elsewhere` - ids of shards that exist but already failed; depending
///   on one yields [`OrderFailure::DependencyFailed`] instead of `Missing`
pub fn plan_install(nodes: &[(String, Vec<String>)], failed_elsewhere: &HashSet<String>) -> InstallPlan {
    let graph = build_graph(nodes);
    let mut failures: HashMap<usize, OrderFailure> = HashMap::new();

    // Phase 1: cycles and unknown ids. Every member of a strongly connected
    // component with more than one node, or with a self edge, is on a cycle.
    for component in strongly_connected(&graph) {
        let cyclic = component.len() > 1 || graph.edges[component[0]].contains(&component[0]);
        if !cyclic {
            continue;
        }
        let members: HashSet<usize> = component.iter().copied().collect();
        for &member in &component {
            let cycle = shortest_cycle(&graph, member, &members)
                .into_iter()
                .map(|node| graph.ids[node].to_string())
                .collect();
            failures.insert(member, OrderFailure::Cycle { cycle });
        }
    }
    for (node, unknown) in graph.unknown.iter().enumerate() {
        if let Some(&dependency) = unknown.first() {
            let failure = if failed_elsewhere.contains(dependency) {
                OrderFailure::DependencyFailed {
                    dependency: dependency.to_string(),
                }
            } else {
                OrderFailure::Missing {
                    missing: dependency.to_string(),
                }
            };
            failures.entry(node).or_insert(failure);
        }
    }

    // Phase 2: anything depending on a failed shard fails too.
    loop {
        let mut changed = false;
        for node in 0..graph.ids.len() {
            if failures.contains_key(&node) {
                continue;
            }
            if let Some(&dependency) = graph.edges[node].iter().find(|&&dep| failures.contains_key(&dep)) {
                failures.insert(
                    node,
                    OrderFailure::DependencyFailed {
                        dependency: graph.ids[dependency].to_string(),
                    },
                );
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Phase 3: Kahn's algorithm, smallest discovery index first.
    let mut remaining: Vec<usize> = vec![0; graph.ids.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.ids.len()];
    for node in (0..graph.ids.len()).filter(|node| !failures.contains_key(node)) {
        remaining[node] = graph.edges[node].len();
        for &dependency in &graph.edges[node] {
            dependents[dependency].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..graph.ids.len())
        .filter(|node| !failures.contains_key(node) && remaining[*node] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::new();
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph.ids[node].to_string());
        for &dependent in &dependents[node] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    let mut failures: Vec<(usize, OrderFailure)> = failures.into_iter().collect();
    failures.sort_by_key(|(node, _)| *node);

    InstallPlan {
        order,
        failures: failures
            .into_iter()
            .map(|(node, failure)| (graph.ids[node].to_string(), failure))
            .collect(),
    }
}

fn build_graph(nodes: &[(String, Vec<String>)]) -> Graph<'_> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, (id, _))| (id.as_str(), position))
        .collect();

    let mut edges = Vec::with_capacity(nodes.len());
    let mut unknown = Vec::with_capacity(nodes.len());
    for (_, dependencies) in nodes {
        let mut known = Vec::new();
        let mut missing = Vec::new();
        for dependency in dependencies {
            match index.get(dependency.as_str()) {
                Some(&target) if !known.contains(&target) => known.push(target),
                Some(_) => {}
                None => missing.push(dependency.as_str()),
            }
        }
        edges.push(known);
        unknown.push(missing);
    }

    Graph {
        ids: nodes.iter().map(|(id, _)| id.as_str()).collect(),
        edges,
        unknown,
    }
}

/// Tarjan's algorithm; components come out with members in discovery order.
fn strongly_connected(graph: &Graph<'_>) -> Vec<Vec<usize>> {
    struct Tarjan<'g, 'a> {
        graph: &'g Graph<'a>,
        next_index: usize,
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_, '_> {
        fn connect(&mut self, node: usize) {
            self.index[node] = Some(self.next_index);
            self.low[node] = self.next_index;
            self.next_index += 1;
            self.stack.push(node);
            self.on_stack[node] = true;

            let graph = self.graph;
            for &dependency in &graph.edges[node] {
                match self.index[dependency] {
                    None => {
                        self.connect(dependency);
                        self.low[node] = self.low[node].min(self.low[dependency]);
                    }
                    Some(index) if self.on_stack[dependency] => {
                        self.low[node] = self.low[node].min(index);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.low[node]) == self.index[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                self.components.push(component);
            }
        }
    }

    let count = graph.ids.len();
    let mut tarjan = Tarjan {
        graph,
        next_index: 0,
        index: vec![None; count],
        low: vec![0; count],
        on_stack: vec![false; count],
        stack: Vec::new(),
        components: Vec::new(),
    };
    for node in 0..count {
        if tarjan.index[node].is_none() {
            tarjan.connect(node);
        }
    }
    tarjan.components
}

/// The shortest path from `start` back to itself inside one component,
/// starting and ending with `start`.
fn shortest_cycle(graph: &Graph<'_>, start: usize, members: &HashSet<usize>) -> Vec<usize> {
    let mut previous: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in graph.edges[node].iter().filter(|next| members.contains(next)) {
            if next == start {
                let mut path = Vec::new();
                let mut cursor = node;
                while cursor != start {
                    path.push(cursor);
                    match previous.get(&cursor) {
                        Some(&before) => cursor = before,
                        None => break,
                    }
                }
                path.push(start);
                path.reverse();
                path.push(start);
                return path;
            }
            if !previous.contains_key(&next) {
                previous.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    vec![start, start]
}
