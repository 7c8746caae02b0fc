//! Shared test fixtures: canned configurations, applications, and an
//! in-memory `GitClient` for driving the worker fabric without a network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::ApplicationConfiguration;
use crate::models::{Application, ApplicationEventType, CommitDetails};
use crate::types::Sha;
use crate::versioning::{GitClient, GitError, GitResult, RemoteBranch, RemoteTag};

/// Builds a SHA from a short hex prefix, right-padded with zeros.
pub fn sha(prefix: &str) -> Sha {
    let mut s = prefix.to_string();
    while s.len() < 40 {
        s.push('0');
    }
    Sha::parse(s).unwrap()
}

/// Minimal valid application configuration.
pub fn test_configuration(name: &str) -> ApplicationConfiguration {
    serde_yaml::from_str(&format!(
        r#"
name: {name}
remote: https://example.com/{name}.git
target: http://127.0.0.1:{{{{port}}}}
"#
    ))
    .unwrap()
}

/// An application rooted under the system temp directory.
pub fn test_application(name: &str) -> Arc<Application> {
    test_application_with(name, |_| {})
}

/// An application with configuration tweaks applied.
pub fn test_application_with(
    name: &str,
    tweak: impl FnOnce(&mut ApplicationConfiguration),
) -> Arc<Application> {
    let mut configuration = test_configuration(name);
    tweak(&mut configuration);
    Arc::new(Application::new(
        configuration,
        "test.yml",
        &std::env::temp_dir().join("polo-tests"),
    ))
}

/// Asserts that `expected` events arrive on the bus, in order, within
/// `timeout` overall.
pub async fn assert_application_events(
    events: &mut broadcast::Receiver<ApplicationEventType>,
    expected: &[ApplicationEventType],
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    for expected_event in expected {
        let received = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {expected_event:?}"))
            .expect("event bus closed");
        assert_eq!(&received, expected_event);
    }
}

/// Mutable upstream state served by the mock git client.
#[derive(Default)]
struct MockRemoteState {
    branches: HashMap<String, RemoteBranch>,
    tags: Vec<RemoteTag>,
    commits: Vec<CommitDetails>,
    fail_clone: bool,
    fail_fetch: bool,
    fail_provision: bool,
}

/// In-memory `GitClient`: one fake upstream shared by every repository
/// path. Tests mutate the upstream between fetches to simulate pushes.
#[derive(Default)]
pub struct MockGitClient {
    state: Mutex<MockRemoteState>,
    pub clone_count: AtomicUsize,
    pub fetch_count: AtomicUsize,
    pub provision_count: AtomicUsize,
}

impl MockGitClient {
    pub fn new() -> Arc<Self> {
        Arc::new(MockGitClient::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockRemoteState> {
        self.state.lock().expect("mock git state poisoned")
    }

    /// Points a branch at a commit, registering the commit in the walk.
    pub fn set_branch(&self, name: &str, hash: Sha) {
        let mut state = self.lock();
        let details = CommitDetails {
            hash: hash.clone(),
            author: "dev@example.com".to_string(),
            date: Utc::now(),
            message: format!("commit on {name}"),
        };
        state.branches.insert(
            name.to_string(),
            RemoteBranch {
                name: name.to_string(),
                hash,
                author: details.author.clone(),
                date: details.date,
                message: details.message.clone(),
            },
        );
        state.commits.push(details);
    }

    /// Registers a tag pointing at an existing commit.
    pub fn set_tag(&self, name: &str, hash: Sha) {
        self.lock().tags.push(RemoteTag {
            name: name.to_string(),
            hash,
        });
    }

    pub fn fail_clone(&self, fail: bool) {
        self.lock().fail_clone = fail;
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.lock().fail_fetch = fail;
    }

    pub fn fail_provision(&self, fail: bool) {
        self.lock().fail_provision = fail;
    }

    fn command_failed(command: &str) -> GitError {
        GitError::CommandFailed {
            command: command.to_string(),
            stderr: "mock failure".to_string(),
        }
    }
}

#[async_trait]
impl GitClient for MockGitClient {
    async fn clone_repository(
        &self,
        _remote: &str,
        _auth: Option<&crate::config::AuthConfiguration>,
        destination: &Path,
    ) -> GitResult<()> {
        if self.lock().fail_clone {
            return Err(Self::command_failed("git clone"));
        }
        self.clone_count.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(destination)?;
        Ok(())
    }

    async fn fetch_all(&self, _repo_folder: &Path) -> GitResult<()> {
        if self.lock().fail_fetch {
            return Err(Self::command_failed("git fetch --all"));
        }
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn branches(&self, _repo_folder: &Path) -> GitResult<Vec<RemoteBranch>> {
        let mut branches: Vec<RemoteBranch> = self.lock().branches.values().cloned().collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn tags(&self, _repo_folder: &Path) -> GitResult<Vec<RemoteTag>> {
        Ok(self.lock().tags.clone())
    }

    async fn commits_since(
        &self,
        _repo_folder: &Path,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> GitResult<Vec<CommitDetails>> {
        Ok(self
            .lock()
            .commits
            .iter()
            .filter(|commit| commit.date >= since && commit.date <= until)
            .cloned()
            .collect())
    }

    async fn provision_commit_tree(
        &self,
        _base: &Path,
        destination: &Path,
        _sha: &Sha,
    ) -> GitResult<()> {
        if self.lock().fail_provision {
            return Err(Self::command_failed("git clone --local"));
        }
        self.provision_count.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(destination)?;
        Ok(())
    }
}
