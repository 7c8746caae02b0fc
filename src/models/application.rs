//! Per-application configuration and git state.
//!
//! An application is created at startup (or by config reload), initialized
//! exactly once, refetched periodically, and never destroyed during the
//! process lifetime. Its git state (ref→SHA maps, branches, tags, commit
//! walk) is rebuilt off to the side by the fetch worker and swapped in one
//! write-lock acquisition, so readers always observe a consistent snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ApplicationConfiguration;
use crate::types::Sha;

/// Capacity of the per-application event bus. Subscribers slower than this
/// observe a `Lagged` error rather than blocking the producer.
const EVENT_BUS_CAPACITY: usize = 64;

/// Lifecycle events observable on the application bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationEventType {
    InitializationStarted,
    FetchStarted,
    FetchCompleted,
    InitializationCompleted,
    InitializationFailed,
    HotSwap,
}

/// Branches and tags pointing at one commit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteObject {
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

/// Tip metadata for one branch.
#[derive(Debug, Clone, Serialize)]
pub struct Branch {
    pub name: String,
    pub hash: Sha,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

/// Metadata for one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDetails {
    pub hash: Sha,
    pub author: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// The git-derived view of an application, rebuilt on every fetch.
///
/// `objects_to_hash_map` is total over all known refs: every branch (in its
/// bare, `origin/`-prefixed and fully-qualified forms), every tag (bare and
/// fully-qualified), and every walked commit SHA mapping to itself.
#[derive(Debug, Clone, Default)]
pub struct ApplicationGitState {
    pub objects_to_hash_map: HashMap<String, Sha>,
    pub hash_to_objects_map: HashMap<Sha, RemoteObject>,
    pub branches: HashMap<String, Branch>,
    pub tags: Vec<String>,
    pub commits: Vec<Sha>,
    pub commit_map: HashMap<Sha, CommitDetails>,
}

/// A configured git repository with build/run instructions.
pub struct Application {
    /// Unique name; stable across configuration reloads.
    pub name: String,

    /// Source configuration file path.
    pub filename: PathBuf,

    /// Canonical clone used as the source for per-session working trees.
    pub base_folder: PathBuf,

    /// Root for this application's per-commit session folders.
    pub sessions_folder: PathBuf,

    configuration: RwLock<ApplicationConfiguration>,
    git_state: RwLock<ApplicationGitState>,
    bus: broadcast::Sender<ApplicationEventType>,
}

impl Application {
    /// Creates an application from its configuration.
    ///
    /// `sessions_folder` is the global sessions root; the application's
    /// canonical clone lives under `<sessions_folder>/<name>/.base` and
    /// per-commit trees under `<sessions_folder>/<name>/<sha>`.
    pub fn new(
        configuration: ApplicationConfiguration,
        filename: impl Into<PathBuf>,
        sessions_folder: &Path,
    ) -> Application {
        let name = configuration.name.clone();
        let app_folder = sessions_folder.join(&name);
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Application {
            name,
            filename: filename.into(),
            base_folder: app_folder.join(".base"),
            sessions_folder: app_folder,
            configuration: RwLock::new(configuration),
            git_state: RwLock::new(ApplicationGitState::default()),
            bus,
        }
    }

    // ─── Configuration ───

    /// Returns a snapshot of the current configuration.
    pub fn configuration(&self) -> ApplicationConfiguration {
        self.configuration
            .read()
            .expect("configuration lock poisoned")
            .clone()
    }

    /// Swaps the configuration (hot reload) and emits `HotSwap`.
    pub fn set_configuration(&self, configuration: ApplicationConfiguration) {
        *self
            .configuration
            .write()
            .expect("configuration lock poisoned") = configuration;
        self.emit(ApplicationEventType::HotSwap);
    }

    pub fn is_default(&self) -> bool {
        self.configuration
            .read()
            .expect("configuration lock poisoned")
            .is_default
    }

    /// Whether `checkout` is in the watch list.
    pub fn is_watched(&self, checkout: &str) -> bool {
        self.configuration
            .read()
            .expect("configuration lock poisoned")
            .watch
            .iter()
            .any(|watched| watched == checkout)
    }

    // ─── Git state ───

    /// Reads the git state under the read lock.
    pub fn with_git_state<T>(&self, f: impl FnOnce(&ApplicationGitState) -> T) -> T {
        f(&self.git_state.read().expect("git state lock poisoned"))
    }

    /// Atomically replaces the whole git state (fetch worker only).
    pub fn replace_git_state(&self, state: ApplicationGitState) {
        *self.git_state.write().expect("git state lock poisoned") = state;
    }

    /// Resolves a ref string (branch, `origin/branch`, fully-qualified ref,
    /// tag, or commit SHA) to a commit SHA.
    pub fn resolve_checkout(&self, checkout: &str) -> Option<Sha> {
        self.with_git_state(|state| state.objects_to_hash_map.get(checkout).cloned())
    }

    /// Returns commit metadata for a resolved SHA.
    pub fn commit_details(&self, sha: &Sha) -> Option<CommitDetails> {
        self.with_git_state(|state| state.commit_map.get(sha).cloned())
    }

    // ─── Event bus ───

    /// Subscribes to lifecycle events. Each subscriber gets its own buffer;
    /// a slow subscriber lags instead of blocking the producers.
    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationEventType> {
        self.bus.subscribe()
    }

    /// Emits an event; a bus with no subscribers drops it silently.
    pub fn emit(&self, event: ApplicationEventType) {
        let _ = self.bus.send(event);
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("base_folder", &self.base_folder)
            .finish_non_exhaustive()
    }
}
