//! Graph builder for turning a flat component list into a dependency graph.
//!
//! Declared dependencies become edges directly. Components that touch the
//! same file are made mutually sequential with a synthetic edge, oriented by
//! plan order unless the pair is already ordered through other edges.

use super::schedule;
use crate::component::Component;
use crate::errors::{CyclicDependencyError, GraphError};
use crate::plan::PlanFile;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// Index into the component list.
pub type ComponentIndex = usize;

/// Directed acyclic graph of components.
///
/// An edge `from -> to` means `from` must reach `Committed` before `to` may
/// start.
#[derive(Debug)]
pub struct ComponentGraph {
    /// Components in plan order
    components: Vec<Component>,
    /// Map from component id to index
    index_map: HashMap<String, ComponentIndex>,
    /// index -> components that wait on it
    forward_edges: Vec<Vec<ComponentIndex>>,
    /// index -> components it waits on
    reverse_edges: Vec<Vec<ComponentIndex>>,
    /// Synthetic edges added for same-file conflicts
    conflict_edges: Vec<(ComponentIndex, ComponentIndex)>,
    independent_groups: Vec<Vec<String>>,
    sequential_chains: Vec<Vec<String>>,
}

impl ComponentGraph {
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<ComponentIndex> {
        self.index_map.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.index_of(id).and_then(|i| self.components.get(i))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Component> {
        let index = self.index_of(id)?;
        self.components.get_mut(index)
    }

    pub fn component(&self, index: ComponentIndex) -> Option<&Component> {
        self.components.get(index)
    }

    /// All components in plan order.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn ids(&self) -> Vec<String> {
        self.components.iter().map(|c| c.id.clone()).collect()
    }

    /// Components that wait on `index`.
    pub fn dependents(&self, index: ComponentIndex) -> &[ComponentIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Components `index` waits on, declared or synthetic.
    pub fn dependencies(&self, index: ComponentIndex) -> &[ComponentIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn edge_count(&self) -> usize {
        self.forward_edges.iter().map(Vec::len).sum()
    }

    /// Synthetic same-file edges as `(before, after)` id pairs.
    pub fn conflict_edges(&self) -> Vec<(&str, &str)> {
        self.conflict_edges
            .iter()
            .map(|&(a, b)| (self.components[a].id.as_str(), self.components[b].id.as_str()))
            .collect()
    }

    /// Groups of components that can run side by side, in dependency-depth
    /// order. Components on a sequential chain are not repeated here.
    pub fn independent_groups(&self) -> &[Vec<String>] {
        &self.independent_groups
    }

    /// Maximal linear dependency chains, each in execution order.
    pub fn sequential_chains(&self) -> &[Vec<String>] {
        &self.sequential_chains
    }

    /// Every component that declares a dependency on `id`, directly or
    /// transitively, in plan order. Same-file ordering edges are not
    /// followed: they only sequence work, they do not consume its output.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let mut seen: HashSet<ComponentIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let node_id = &self.components[node].id;
            for &next in self.dependents(node) {
                let declared = self.components[next].dependencies.contains(node_id);
                if declared && seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut found: Vec<ComponentIndex> = seen.into_iter().collect();
        found.sort_unstable();
        found
            .into_iter()
            .map(|i| self.components[i].id.clone())
            .collect()
    }

    /// Compute execution waves: each wave holds the components whose
    /// predecessors all sit in earlier waves.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        self.wave_indices()
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .map(|i| self.components[i].id.clone())
                    .collect()
            })
            .collect()
    }

    pub(crate) fn wave_indices(&self) -> Vec<Vec<ComponentIndex>> {
        let mut waves = Vec::new();
        let mut placed: HashSet<ComponentIndex> = HashSet::new();

        loop {
            let ready: Vec<ComponentIndex> = (0..self.len())
                .filter(|i| !placed.contains(i))
                .filter(|&i| self.dependencies(i).iter().all(|d| placed.contains(d)))
                .collect();

            if ready.is_empty() {
                break;
            }
            placed.extend(ready.iter().copied());
            waves.push(ready);
        }

        waves
    }

    fn reaches(&self, from: ComponentIndex, to: ComponentIndex) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.dependents(node).iter().copied());
            }
        }
        false
    }

    fn add_edge(&mut self, from: ComponentIndex, to: ComponentIndex) {
        if !self.forward_edges[from].contains(&to) {
            self.forward_edges[from].push(to);
            self.reverse_edges[to].push(from);
        }
    }
}

/// Builder for constructing component graphs.
pub struct GraphBuilder {
    components: Vec<Component>,
    conflicts: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new(components: Vec<Component>) -> Self {
        Self {
            components,
            conflicts: Vec::new(),
        }
    }

    pub fn from_plan(plan: &PlanFile) -> Self {
        let components = plan.components.iter().map(Component::from_spec).collect();
        let mut builder = Self::new(components);
        for [a, b] in &plan.conflicts {
            builder = builder.with_conflict(a, b);
        }
        builder
    }

    /// Declare that two components must not run concurrently.
    pub fn with_conflict(mut self, a: &str, b: &str) -> Self {
        self.conflicts.push((a.to_string(), b.to_string()));
        self
    }

    /// Build the component graph.
    ///
    /// Validates that ids are unique, every dependency names a known
    /// component, and the declared edges are acyclic. Conflict edges are
    /// added afterwards and never close a cycle.
    pub fn build(self) -> Result<ComponentGraph, GraphError> {
        let mut index_map = HashMap::new();
        for (i, component) in self.components.iter().enumerate() {
            if index_map.insert(component.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateComponent {
                    id: component.id.clone(),
                });
            }
        }

        let n = self.components.len();
        let mut graph = ComponentGraph {
            components: self.components,
            index_map,
            forward_edges: vec![Vec::new(); n],
            reverse_edges: vec![Vec::new(); n],
            conflict_edges: Vec::new(),
            independent_groups: Vec::new(),
            sequential_chains: Vec::new(),
        };

        for to in 0..n {
            let deps: Vec<String> = graph.components[to].dependencies.iter().cloned().collect();
            for dep in deps {
                let from = graph.index_of(&dep).ok_or_else(|| GraphError::UnknownDependency {
                    component: graph.components[to].id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to);
            }
        }

        if let Some(cycle) = find_cycle(&graph.forward_edges) {
            return Err(CyclicDependencyError {
                cycle: cycle
                    .into_iter()
                    .map(|i| graph.components[i].id.clone())
                    .collect(),
            }
            .into());
        }

        for (a, b) in conflicting_pairs(&graph, &self.conflicts)? {
            if graph.reaches(a, b) || graph.reaches(b, a) {
                continue;
            }
            graph.add_edge(a, b);
            graph.conflict_edges.push((a, b));
        }

        let (groups, chains) = schedule::partition(&graph);
        graph.independent_groups = groups;
        graph.sequential_chains = chains;

        Ok(graph)
    }
}

/// Unordered component pairs that share a file or were declared conflicting,
/// normalised to `(earlier, later)` plan order.
fn conflicting_pairs(
    graph: &ComponentGraph,
    explicit: &[(String, String)],
) -> Result<Vec<(ComponentIndex, ComponentIndex)>, GraphError> {
    let mut pairs: BTreeSet<(ComponentIndex, ComponentIndex)> = BTreeSet::new();

    let mut by_file: HashMap<PathBuf, Vec<ComponentIndex>> = HashMap::new();
    for (i, component) in graph.components.iter().enumerate() {
        for file in component.files() {
            by_file.entry(file).or_default().push(i);
        }
    }
    for owners in by_file.values() {
        for (pos, &a) in owners.iter().enumerate() {
            for &b in &owners[pos + 1..] {
                if a != b {
                    pairs.insert((a.min(b), a.max(b)));
                }
            }
        }
    }

    for (a, b) in explicit {
        let ia = graph
            .index_of(a)
            .ok_or_else(|| GraphError::UnknownConflict { id: a.clone() })?;
        let ib = graph
            .index_of(b)
            .ok_or_else(|| GraphError::UnknownConflict { id: b.clone() })?;
        if ia != ib {
            pairs.insert((ia.min(ib), ia.max(ib)));
        }
    }

    Ok(pairs.into_iter().collect())
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first search with recursion-stack coloring. Returns the first cycle
/// found, closed by repeating its first node.
fn find_cycle(forward: &[Vec<ComponentIndex>]) -> Option<Vec<ComponentIndex>> {
    fn visit(
        node: ComponentIndex,
        forward: &[Vec<ComponentIndex>],
        color: &mut [Color],
        stack: &mut Vec<ComponentIndex>,
    ) -> Option<Vec<ComponentIndex>> {
        color[node] = Color::Gray;
        stack.push(node);
        for &next in &forward[node] {
            match color[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == next)?;
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, forward, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node] = Color::Black;
        None
    }

    let mut color = vec![Color::White; forward.len()];
    let mut stack = Vec::new();
    for node in 0..forward.len() {
        if color[node] == Color::White
            && let Some(cycle) = visit(node, forward, &mut color, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}
