//! Repository source trees.
//!
//! Clone-and-proxy mode mounts the pushed tree into a fresh environment. The
//! resolver fetches exactly the pushed commit into a scratch directory and
//! strips the git metadata, leaving only the files the hooks should see.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;

use crate::config::SourceConfig;
use crate::error::ResolveError;

/// A checked-out tree at one commit.
///
/// When the tree owns its checkout, dropping it deletes the directory.
#[derive(Debug)]
pub struct SourceTree {
    path: PathBuf,
    _checkout: Option<TempDir>,
}

impl SourceTree {
    /// A tree at an existing path the caller keeps alive.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _checkout: None,
        }
    }

    fn owned(checkout: TempDir) -> Self {
        Self {
            path: checkout.path().to_path_buf(),
            _checkout: Some(checkout),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fetches repository trees.
#[async_trait::async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `full_name` (`owner/repo`) at `commit`.
    async fn resolve(&self, full_name: &str, commit: &str) -> Result<SourceTree, ResolveError>;
}

/// Resolves trees with the `git` command-line client.
#[derive(Debug, Clone)]
pub struct GitResolver {
    base_url: String,
    git: PathBuf,
}

impl GitResolver {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base_url: config.clone_base_url.clone(),
            git: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable.
    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    async fn git(&self, dir: &Path, repository: &str, args: &[&str]) -> Result<(), ResolveError> {
        let command = args.first().copied().unwrap_or_default().to_string();

        let output = tokio::process::Command::new(&self.git)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ResolveError::GitUnavailable {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ResolveError::Git {
                repository: repository.to_string(),
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl SourceResolver for GitResolver {
    async fn resolve(&self, full_name: &str, commit: &str) -> Result<SourceTree, ResolveError> {
        let url = clone_url(&self.base_url, full_name);

        if commit.starts_with('-') {
            return Err(ResolveError::Git {
                repository: url,
                command: "fetch".to_string(),
                stderr: format!("invalid revision {commit:?}"),
            });
        }

        let checkout = tempfile::Builder::new()
            .prefix("hookrelay-src-")
            .tempdir()?;
        let dir = checkout.path();

        tracing::info!(repository = %url, commit = %commit, "Fetching source tree");

        self.git(dir, &url, &["init", "--quiet"]).await?;
        self.git(dir, &url, &["remote", "add", "origin", url.as_str()]).await?;
        self.git(dir, &url, &["fetch", "--quiet", "--depth", "1", "origin", commit])
            .await?;
        self.git(dir, &url, &["checkout", "--quiet", "FETCH_HEAD"])
            .await?;

        tokio::fs::remove_dir_all(dir.join(".git")).await?;

        tracing::debug!(repository = %url, path = %dir.display(), "Source tree ready");
        Ok(SourceTree::owned(checkout))
    }
}

/// Clone URL for a repository under `base` (which ends with `/`).
pub fn clone_url(base: &str, full_name: &str) -> String {
    format!("{base}{full_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_url() {
        assert_eq!(
            clone_url("https://github.com/", "acme/site"),
            "https://github.com/acme/site"
        );
    }

    #[test]
    fn test_borrowed_tree_leaves_directory_alone() {
        let dir = tempfile::tempdir().unwrap();
        let tree = SourceTree::new(dir.path());
        assert_eq!(tree.path(), dir.path());
        drop(tree);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_owned_tree_deletes_checkout() {
        let checkout = tempfile::tempdir().unwrap();
        let path = checkout.path().to_path_buf();
        let tree = SourceTree::owned(checkout);
        assert_eq!(tree.path(), path);
        drop(tree);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_git_binary() {
        let resolver = GitResolver::new(&SourceConfig::default())
            .with_git("/nonexistent/hookrelay-git");
        let err = resolver.resolve("acme/site", "abc123").await.unwrap_err();
        assert!(matches!(err, ResolveError::GitUnavailable { ref command, .. } if command == "init"));
    }

    #[tokio::test]
    async fn test_option_like_commit_is_rejected() {
        let resolver = GitResolver::new(&SourceConfig::default());
        let err = resolver
            .resolve("acme/site", "--upload-pack=touch")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Git { .. }));
    }
}
