use super::Committer;
use crate::component::Component;
use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Repository, Signature};
use std::path::{Path, PathBuf};

/// Commits each finished component on the current branch.
pub struct GitCommitter {
    repo: Repository,
    author_name: String,
    author_email: String,
}

impl GitCommitter {
    pub fn open(project_dir: &Path, author_name: &str, author_email: &str) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo,
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    fn workdir(&self) -> Result<&Path> {
        self.repo
            .workdir()
            .context("Repository has no working directory")
    }

    /// Paths relative to the working directory.
    fn relative_paths(&self, component: &Component) -> Result<Vec<PathBuf>> {
        let workdir = self.workdir()?;
        Ok(component
            .touched_files()
            .into_iter()
            .map(|p| match p.strip_prefix(workdir) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => p,
            })
            .collect())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }
}

impl Committer for GitCommitter {
    fn commit(&mut self, component: &Component) -> Result<String> {
        let files = self.relative_paths(component)?;
        let workdir = self.workdir()?.to_path_buf();

        let mut index = self.repo.index().context("Failed to read git index")?;
        for file in &files {
            if workdir.join(file).exists() {
                index
                    .add_path(file)
                    .with_context(|| format!("Failed to stage {}", file.display()))?;
            } else {
                // deleted by the implementer, or never written; libgit2
                // skips paths that are not in the index
                index
                    .remove_path(file)
                    .with_context(|| format!("Failed to unstage {}", file.display()))?;
            }
        }
        index.write().context("Failed to write git index")?;

        let tree_id = index.write_tree().context("Failed to write tree")?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now(&self.author_name, &self.author_email)?;

        let summary = component
            .last_handoff
            .as_ref()
            .map(|h| h.summary.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("pipeline complete");
        let message = format!("[stagehand] {}: {}", component.id, summary);

        let parents: Vec<git2::Commit<'_>> = self.head_commit().into_iter().collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parent_refs)
            .with_context(|| format!("Failed to commit {}", component.id))?;

        Ok(commit_id.to_string())
    }

    fn snapshot_diff(&self, component: &Component) -> Result<Option<String>> {
        let files = self.relative_paths(component)?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        for file in &files {
            opts.pathspec(file.as_path());
        }

        let head_tree = match self.head_commit() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree")?;

        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })
        .context("Failed to render diff")?;

        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&buf).to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::message::Handoff;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitCommitter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let committer = GitCommitter::open(dir.path(), "stagehand", "stagehand@localhost").unwrap();
        (committer, dir)
    }

    fn component_with_files(id: &str, files: &[&str]) -> Component {
        let mut component = Component::new(id);
        component.last_handoff = Some(Handoff {
            component_id: id.into(),
            files_created: files.iter().map(PathBuf::from).collect(),
            files_modified: vec![],
            summary: format!("add {}", id),
        });
        component
    }

    #[test]
    fn test_commit_on_unborn_head() {
        let (mut committer, dir) = setup_repo();
        assert!(committer.head_sha().is_none());
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();

        let sha = committer.commit(&component_with_files("a", &["a.rs"])).unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(committer.head_sha(), Some(sha));

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("[stagehand] a: add a"));
        assert!(head.tree().unwrap().get_name("a.rs").is_some());
    }

    #[test]
    fn test_commit_only_stages_component_files() {
        let (mut committer, dir) = setup_repo();
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        fs::write(dir.path().join("other.rs"), "fn other() {}\n").unwrap();

        committer.commit(&component_with_files("a", &["a.rs"])).unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
        assert!(tree.get_name("a.rs").is_some());
        assert!(tree.get_name("other.rs").is_none());
    }

    #[test]
    fn test_second_commit_has_parent() {
        let (mut committer, dir) = setup_repo();
        fs::write(dir.path().join("a.rs"), "1\n").unwrap();
        committer.commit(&component_with_files("a", &["a.rs"])).unwrap();
        fs::write(dir.path().join("b.rs"), "2\n").unwrap();
        committer.commit(&component_with_files("b", &["b.rs"])).unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.parent_count(), 1);
    }

    #[test]
    fn test_snapshot_diff_shows_uncommitted_changes() {
        let (mut committer, dir) = setup_repo();
        fs::write(dir.path().join("a.rs"), "fn old() {}\n").unwrap();
        let component = component_with_files("a", &["a.rs"]);
        committer.commit(&component).unwrap();

        assert!(committer.snapshot_diff(&component).unwrap().is_none());

        fs::write(dir.path().join("a.rs"), "fn new() {}\n").unwrap();
        let diff = committer.snapshot_diff(&component).unwrap().unwrap();
        assert!(diff.contains("+fn new() {}"));
        assert!(diff.contains("-fn old() {}"));

        // working tree untouched
        assert_eq!(fs::read_to_string(dir.path().join("a.rs")).unwrap(), "fn new() {}\n");
    }

    #[test]
    fn test_commit_drops_deleted_files_from_tree() {
        let (mut committer, dir) = setup_repo();
        fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        fs::write(dir.path().join("old.rs"), "fn old() {}\n").unwrap();
        committer
            .commit(&component_with_files("a", &["a.rs", "old.rs"]))
            .unwrap();

        fs::remove_file(dir.path().join("old.rs")).unwrap();
        committer
            .commit(&component_with_files("b", &["old.rs", "never_written.rs"]))
            .unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
        assert!(tree.get_name("a.rs").is_some());
        assert!(tree.get_name("old.rs").is_none());
        assert!(tree.get_name("never_written.rs").is_none());
    }

    #[test]
    fn test_open_outside_repo_fails() {
        let dir = tempdir().unwrap();
        assert!(GitCommitter::open(dir.path(), "a", "b").is_err());
    }
}
