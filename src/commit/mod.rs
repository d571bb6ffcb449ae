//! The commit side effect gated behind `Passed -> Committed`.

pub mod git;

pub use git::GitCommitter;

use crate::component::Component;
use anyhow::Result;

/// Source-control side effects the router invokes.
pub trait Committer: Send {
    /// Record the component's work. Returns a revision id.
    fn commit(&mut self, component: &Component) -> Result<String>;

    /// Render the component's uncommitted changes, if there are any, without
    /// touching the working tree.
    fn snapshot_diff(&self, component: &Component) -> Result<Option<String>>;
}

/// Committer for dry runs: remembers what it was asked to commit.
#[derive(Debug, Default)]
pub struct NoopCommitter {
    committed: Vec<String>,
}

impl NoopCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> &[String] {
        &self.committed
    }
}

impl Committer for NoopCommitter {
    fn commit(&mut self, component: &Component) -> Result<String> {
        self.committed.push(component.id.clone());
        Ok(format!("dry-run-{}", self.committed.len()))
    }

    fn snapshot_diff(&self, _component: &Component) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_committer_counts() {
        let mut committer = NoopCommitter::new();
        assert_eq!(committer.commit(&Component::new("a")).unwrap(), "dry-run-1");
        assert_eq!(committer.commit(&Component::new("b")).unwrap(), "dry-run-2");
        assert_eq!(committer.committed(), ["a", "b"]);
        assert!(committer.snapshot_diff(&Component::new("a")).unwrap().is_none());
    }
}
