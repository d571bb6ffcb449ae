//! Per-stage queue limits.
//!
//! The depth of a downstream queue is the number of components sitting in
//! its waiting stage. When a queue is full the router parks the upstream
//! result in a hold list instead of advancing the component, and releases it
//! in FIFO order once the downstream worker dequeues something.

use crate::component::Stage;
use crate::graph::ComponentGraph;
use crate::worker::Role;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// A bounded stage queue in front of a downstream worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownstreamQueue {
    Review,
    TestWrite,
    TestRun,
}

impl DownstreamQueue {
    pub const ALL: [DownstreamQueue; 3] = [
        DownstreamQueue::Review,
        DownstreamQueue::TestWrite,
        DownstreamQueue::TestRun,
    ];

    /// Stage a component occupies while it waits in this queue.
    pub fn waiting_stage(self) -> Stage {
        match self {
            DownstreamQueue::Review => Stage::AwaitingReview,
            DownstreamQueue::TestWrite => Stage::AwaitingTests,
            DownstreamQueue::TestRun => Stage::AwaitingRun,
        }
    }

    /// Worker that drains this queue.
    pub fn consumer(self) -> Role {
        match self {
            DownstreamQueue::Review => Role::Reviewer,
            DownstreamQueue::TestWrite => Role::TestWriter,
            DownstreamQueue::TestRun => Role::TestRunner,
        }
    }

    pub fn for_consumer(role: Role) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.consumer() == role)
    }
}

impl fmt::Display for DownstreamQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownstreamQueue::Review => "review",
            DownstreamQueue::TestWrite => "test-write",
            DownstreamQueue::TestRun => "test-run",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capacities {
    pub review: usize,
    pub test_write: usize,
    pub test_run: usize,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            review: 2,
            test_write: 2,
            test_run: 3,
        }
    }
}

impl Capacities {
    pub fn get(&self, queue: DownstreamQueue) -> usize {
        match queue {
            DownstreamQueue::Review => self.review,
            DownstreamQueue::TestWrite => self.test_write,
            DownstreamQueue::TestRun => self.test_run,
        }
    }
}

/// Depth accounting and hold lists for the three downstream queues.
#[derive(Debug, Default)]
pub struct StageQueues {
    capacities: Capacities,
    held: HashMap<DownstreamQueue, VecDeque<String>>,
}

impl StageQueues {
    pub fn new(capacities: Capacities) -> Self {
        Self {
            capacities,
            held: HashMap::new(),
        }
    }

    pub fn capacities(&self) -> Capacities {
        self.capacities
    }

    pub fn depth(&self, graph: &ComponentGraph, queue: DownstreamQueue) -> usize {
        let waiting = queue.waiting_stage();
        graph
            .components()
            .iter()
            .filter(|c| c.stage == waiting)
            .count()
    }

    pub fn has_room(&self, graph: &ComponentGraph, queue: DownstreamQueue) -> bool {
        self.depth(graph, queue) < self.capacities.get(queue)
    }

    pub fn hold(&mut self, queue: DownstreamQueue, component_id: &str) {
        self.held
            .entry(queue)
            .or_default()
            .push_back(component_id.to_string());
    }

    pub fn release_next(&mut self, queue: DownstreamQueue) -> Option<String> {
        self.held.get_mut(&queue)?.pop_front()
    }

    pub fn held(&self, queue: DownstreamQueue) -> Vec<String> {
        self.held
            .get(&queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_held(&self, component_id: &str) -> bool {
        self.held
            .values()
            .any(|q| q.iter().any(|id| id == component_id))
    }
}
