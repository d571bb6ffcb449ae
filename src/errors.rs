//! Typed error hierarchy for the stagehand orchestrator.
//!
//! Three top-level enums cover the three layers:
//! - `GraphError`: plan ingestion and component graph construction
//! - `RouterError`: stage transitions and message routing
//! - `OrchestratorError`: the run loop that ties workers to the router

use crate::component::Stage;
use crate::worker::Role;
use thiserror::Error;

/// The component graph contains a dependency cycle.
///
/// `cycle` lists the ids along the cycle in edge order, with the first id
/// repeated at the end (`a -> b -> a`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
pub struct CyclicDependencyError {
    pub cycle: Vec<String>,
}

/// Errors from building a component graph. All of them are fatal: no partial
/// graph is ever returned.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),

    #[error("Unknown dependency '{dependency}' in component '{component}'")]
    UnknownDependency {
        component: String,
        dependency: String,
    },

    #[error("Duplicate component id: {id}")]
    DuplicateComponent { id: String },

    #[error("File conflict references unknown component '{id}'")]
    UnknownConflict { id: String },
}

/// Errors from the stage router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Component {id} not found")]
    UnknownComponent { id: String },

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: Stage, to: Stage },

    #[error("Unexpected {message} for {id} in stage {stage}")]
    UnexpectedMessage {
        id: String,
        stage: Stage,
        message: String,
    },

    #[error("Audit log write failed: {0}")]
    Audit(#[source] anyhow::Error),
}

/// Errors from the orchestrator run loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("No worker registered for role {role}")]
    WorkerMissing { role: Role },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_error_renders_path() {
        let err = CyclicDependencyError {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn graph_error_converts_from_cycle() {
        let err: GraphError = CyclicDependencyError {
            cycle: vec!["x".into(), "x".into()],
        }
        .into();
        match &err {
            GraphError::Cyclic(c) => assert_eq!(c.cycle.len(), 2),
            _ => panic!("Expected GraphError::Cyclic"),
        }
        assert!(err.to_string().contains("Cyclic"));
    }

    #[test]
    fn invalid_transition_names_both_stages() {
        let err = RouterError::InvalidTransition {
            id: "api".into(),
            from: Stage::Pending,
            to: Stage::Committed,
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("committed"));
    }

    #[test]
    fn orchestrator_error_wraps_router_error() {
        let inner = RouterError::UnknownComponent { id: "ghost".into() };
        let err: OrchestratorError = inner.into();
        assert!(matches!(
            err,
            OrchestratorError::Router(RouterError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GraphError::DuplicateComponent { id: "a".into() });
        assert_std_error(&RouterError::UnknownComponent { id: "a".into() });
        assert_std_error(&OrchestratorError::WorkerMissing {
            role: Role::Reviewer,
        });
    }
}
