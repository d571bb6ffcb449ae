//! Execution mode selection and the group/chain partition of a graph.

use super::builder::{ComponentGraph, ComponentIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How components are fed into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One component in flight at a time.
    Sequential,
    /// Every component is independent; all of them start at once.
    FullPipeline,
    /// Independent components first, dependent chains as their inputs commit.
    Mixed,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::FullPipeline => "full-pipeline",
            ExecutionMode::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeRequest {
    #[default]
    Auto,
    Sequential,
}

impl ComponentGraph {
    /// Pick the execution mode for this graph.
    ///
    /// An explicit sequential request always wins. Otherwise a graph where
    /// no wave holds more than two components (every component has at most
    /// one concurrent sibling) is run sequentially, a graph with no edges
    /// runs as a full pipeline, and anything else is mixed.
    pub fn select_mode(&self, request: ModeRequest) -> ExecutionMode {
        if request == ModeRequest::Sequential || self.len() <= 1 {
            return ExecutionMode::Sequential;
        }
        let widest = self.wave_indices().iter().map(Vec::len).max().unwrap_or(0);
        if widest <= MAX_SEQUENTIAL_WAVE {
            ExecutionMode::Sequential
        } else if self.edge_count() == 0 {
            ExecutionMode::FullPipeline
        } else {
            ExecutionMode::Mixed
        }
    }
}

/// A component plus its one allowed concurrent sibling.
const MAX_SEQUENTIAL_WAVE: usize = 2;

/// `u -> v` is a chain link when it is the only edge out of `u` and the only
/// edge into `v`.
fn is_link(graph: &ComponentGraph, u: ComponentIndex, v: ComponentIndex) -> bool {
    graph.dependents(u) == [v] && graph.dependencies(v) == [u]
}

fn link_from(graph: &ComponentGraph, u: ComponentIndex) -> Option<ComponentIndex> {
    match graph.dependents(u) {
        [v] if is_link(graph, u, *v) => Some(*v),
        _ => None,
    }
}

fn link_into(graph: &ComponentGraph, v: ComponentIndex) -> Option<ComponentIndex> {
    match graph.dependencies(v) {
        [u] if is_link(graph, *u, v) => Some(*u),
        _ => None,
    }
}

/// Split the graph into sequential chains (maximal linear paths of two or
/// more components) and independent groups (everything else, grouped by
/// wave). Every component lands in exactly one of the two.
pub(crate) fn partition(graph: &ComponentGraph) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
    let id = |i: ComponentIndex| graph.components()[i].id.clone();

    let mut on_chain: HashSet<ComponentIndex> = HashSet::new();
    let mut chains = Vec::new();
    for start in 0..graph.len() {
        if link_into(graph, start).is_some() || link_from(graph, start).is_none() {
            continue;
        }
        let mut chain = vec![start];
        let mut cursor = start;
        while let Some(next) = link_from(graph, cursor) {
            chain.push(next);
            cursor = next;
        }
        on_chain.extend(chain.iter().copied());
        chains.push(chain.into_iter().map(id).collect());
    }

    let groups = graph
        .wave_indices()
        .into_iter()
        .map(|wave| {
            wave.into_iter()
                .filter(|i| !on_chain.contains(i))
                .map(id)
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect();

    (groups, chains)
}
