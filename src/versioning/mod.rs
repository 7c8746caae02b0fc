//! Git plumbing behind the `GitClient` seam.
//!
//! The workers never touch git directly; they go through [`GitClient`], so
//! tests can drive the whole worker fabric with an in-memory fake. The
//! production implementation shells out to the `git` binary.

pub mod cli;

pub use cli::CliGitClient;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::AuthConfiguration;
use crate::models::CommitDetails;
use crate::types::Sha;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Unparsable git output.
    #[error("unparsable git output: {line}")]
    UnparsableOutput { line: String },

    /// Requested object does not exist in the repository.
    #[error("object not found: {object}")]
    ObjectNotFound { object: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Tip of one remote branch, with its commit metadata.
#[derive(Debug, Clone)]
pub struct RemoteBranch {
    pub name: String,
    pub hash: Sha,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

/// One tag and the commit it points at (annotated tags dereferenced).
#[derive(Debug, Clone)]
pub struct RemoteTag {
    pub name: String,
    pub hash: Sha,
}

/// Capability used by the init, fetch, and filesystem workers.
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Clones `remote` into `destination` as the application's canonical
    /// tree. The clone tracks every upstream branch so later fetches keep
    /// `refs/heads/*` current.
    async fn clone_repository(
        &self,
        remote: &str,
        auth: Option<&AuthConfiguration>,
        destination: &Path,
    ) -> GitResult<()>;

    /// Fetches all remotes, tolerating "already up to date".
    async fn fetch_all(&self, repo_folder: &Path) -> GitResult<()>;

    /// Enumerates `refs/heads/*` with tip metadata.
    async fn branches(&self, repo_folder: &Path) -> GitResult<Vec<RemoteBranch>>;

    /// Enumerates `refs/tags/*`, dereferencing annotated tags.
    async fn tags(&self, repo_folder: &Path) -> GitResult<Vec<RemoteTag>>;

    /// Walks the commit log across all refs within `[since, until]`, in
    /// committer-time order.
    async fn commits_since(
        &self,
        repo_folder: &Path,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> GitResult<Vec<CommitDetails>>;

    /// Provisions a working tree for one commit at `destination`, cloning
    /// (hard-linking where the filesystem allows) from the canonical tree
    /// at `base` and checking out `sha` detached. Idempotent: an existing
    /// destination is reused.
    async fn provision_commit_tree(
        &self,
        base: &Path,
        destination: &Path,
        sha: &Sha,
    ) -> GitResult<()>;
}
