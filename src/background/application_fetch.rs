//! Application fetch worker.
//!
//! Fetches an application's remote, enumerates branches, tags and the
//! commit walk into a fresh git-state snapshot, and swaps it in atomically.
//! When watch diffing is requested, watched refs whose tip moved destroy
//! the matching alive session (marking it replaced) and chain a fresh
//! build; watched refs with no session are auto-started.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info};

use crate::mediator::{
    ApplicationFetchInput, DestroySessionInput, Mediator, RequestReceiver, SessionBuildInput,
};
use crate::models::{
    Application, ApplicationGitState, Branch, KillReason, RemoteObject, Session,
};
use crate::storage::SessionStore;
use crate::types::Sha;
use crate::versioning::GitClient;

/// Consumes `Mediator::application_fetch`.
pub struct ApplicationFetchWorker {
    git: Arc<dyn GitClient>,
    session_storage: Arc<SessionStore>,
    mediator: Mediator,
    /// Lower bound of the commit walk.
    since: DateTime<Utc>,
}

/// Accumulates the ref→SHA map while tracking which watched refs resolved
/// to which tip, de-duplicated by hash so one new commit reachable under
/// several ref spellings triggers a single rebuild.
struct RefRegister {
    watch: Vec<String>,
    objects_to_hash_map: HashMap<String, Sha>,
    watch_results: Vec<(String, Sha)>,
    watched_hashes: HashSet<Sha>,
}

impl RefRegister {
    fn new(watch: Vec<String>) -> Self {
        RefRegister {
            watch,
            objects_to_hash_map: HashMap::new(),
            watch_results: Vec::new(),
            watched_hashes: HashSet::new(),
        }
    }

    fn register(&mut self, ref_name: &str, hash: &Sha) {
        self.objects_to_hash_map
            .insert(ref_name.to_string(), hash.clone());
        if self.watch.iter().any(|watched| watched == ref_name)
            && !self.watched_hashes.contains(hash)
        {
            self.watch_results.push((ref_name.to_string(), hash.clone()));
            self.watched_hashes.insert(hash.clone());
        }
    }
}

impl ApplicationFetchWorker {
    pub fn new(
        git: Arc<dyn GitClient>,
        session_storage: Arc<SessionStore>,
        mediator: Mediator,
        since: NaiveDate,
    ) -> Self {
        ApplicationFetchWorker {
            git,
            session_storage,
            mediator,
            since: since
                .and_hms_opt(0, 0, 0)
                .expect("midnight always exists")
                .and_utc(),
        }
    }

    pub async fn run(self, mut rx: RequestReceiver<ApplicationFetchInput, ()>) {
        while let Some((input, reply)) = rx.recv().await {
            self.fetch_application_remote(&input.application, input.watch_objects)
                .await;
            let _ = reply.send(());
        }
    }

    async fn fetch_application_remote(&self, application: &Arc<Application>, watch_objects: bool) {
        let conf = application.configuration();
        let base_folder = application.base_folder.clone();

        if let Err(e) = self.git.fetch_all(&base_folder).await {
            error!(application = %application.name, error = %e, "Fetch failed");
            return;
        }

        let mut register = RefRegister::new(conf.watch.clone());
        let mut state = ApplicationGitState::default();

        // Branches: each tip is reachable under its bare name, its
        // origin-prefixed name, and its fully-qualified ref.
        match self.git.branches(&base_folder).await {
            Ok(branches) => {
                for branch in branches {
                    register.register(&branch.name, &branch.hash);
                    register.register(&format!("origin/{}", branch.name), &branch.hash);
                    register.register(&format!("refs/heads/{}", branch.name), &branch.hash);

                    let object = state
                        .hash_to_objects_map
                        .entry(branch.hash.clone())
                        .or_insert_with(RemoteObject::default);
                    append_without_dup(&mut object.branches, &branch.name);

                    state.branches.insert(
                        branch.name.clone(),
                        Branch {
                            name: branch.name,
                            hash: branch.hash,
                            author: branch.author,
                            date: branch.date,
                            message: branch.message,
                        },
                    );
                }
            }
            Err(e) => {
                error!(application = %application.name, error = %e, "Branch enumeration failed")
            }
        }

        // Tags.
        match self.git.tags(&base_folder).await {
            Ok(tags) => {
                for tag in tags {
                    register.register(&tag.name, &tag.hash);
                    register.register(&format!("refs/tags/{}", tag.name), &tag.hash);
                    append_without_dup(&mut state.tags, &tag.name);
                    let object = state
                        .hash_to_objects_map
                        .entry(tag.hash.clone())
                        .or_insert_with(RemoteObject::default);
                    append_without_dup(&mut object.tags, &tag.name);
                }
            }
            Err(e) => error!(application = %application.name, error = %e, "Tag enumeration failed"),
        }

        // Commit walk: every SHA is its own identity mapping.
        match self
            .git
            .commits_since(&base_folder, self.since, Utc::now())
            .await
        {
            Ok(commits) => {
                for commit in commits {
                    register.register(commit.hash.as_str(), &commit.hash);
                    state.commits.push(commit.hash.clone());
                    state.commit_map.insert(commit.hash.clone(), commit);
                }
            }
            Err(e) => error!(application = %application.name, error = %e, "Commit walk failed"),
        }

        info!(
            application = %application.name,
            commits = state.commits.len(),
            "Fetched application remote"
        );

        let watch_results = register.watch_results;
        state.objects_to_hash_map = register.objects_to_hash_map;
        application.replace_git_state(state);

        if !watch_objects {
            return;
        }

        for (ref_name, hash) in watch_results {
            self.apply_watch_result(application, ref_name, hash).await;
        }
    }

    /// Reconciles one watched ref against the session set: rebuild on tip
    /// movement, auto-start when no session exists, leave up-to-date
    /// sessions alone.
    async fn apply_watch_result(&self, application: &Arc<Application>, ref_name: String, hash: Sha) {
        let found_session = self
            .session_storage
            .get_all_alive_sessions()
            .into_iter()
            .find(|session| {
                session.application_name == application.name && session.checkout == ref_name
            });

        match found_session {
            Some(session) => {
                if session.commit_id() == Some(hash.clone()) {
                    return;
                }
                info!(
                    application = %application.name,
                    watched = %ref_name,
                    "Watch: detected new commit"
                );
                session.set_kill_reason(KillReason::Replaced);
                self.session_storage.update(&session);

                let mediator = self.mediator.clone();
                let application = Arc::clone(application);
                let _ = self
                    .mediator
                    .destroy_session
                    .enqueue(DestroySessionInput::with_callback(
                        session,
                        Box::new(move |destroyed: Arc<Session>| {
                            tokio::spawn(async move {
                                let _ = mediator
                                    .build_session
                                    .enqueue(SessionBuildInput {
                                        application,
                                        checkout: ref_name,
                                        previous_session: Some(destroyed),
                                    })
                                    .await;
                            });
                        }),
                    ))
                    .await;
            }
            None => {
                info!(
                    application = %application.name,
                    watched = %ref_name,
                    "Watch: auto-start"
                );
                let _ = self
                    .mediator
                    .build_session
                    .enqueue(SessionBuildInput {
                        application: Arc::clone(application),
                        checkout: ref_name,
                        previous_session: None,
                    })
                    .await;
            }
        }
    }
}

fn append_without_dup(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::SessionBuildResult;
    use crate::storage::NoopPersistence;
    use crate::test_utils::{MockGitClient, sha, test_application_with};
    use std::time::Duration;

    struct Fabric {
        mediator: Mediator,
        receivers_build: crate::mediator::RequestReceiver<SessionBuildInput, SessionBuildResult>,
        receivers_destroy: crate::mediator::SignalReceiver<DestroySessionInput>,
        storage: Arc<SessionStore>,
        git: Arc<MockGitClient>,
    }

    fn spawn_fabric() -> Fabric {
        let (mediator, receivers) = Mediator::new();
        let storage = Arc::new(SessionStore::new(Box::new(NoopPersistence)));
        let git = MockGitClient::new();
        let worker = ApplicationFetchWorker::new(
            git.clone(),
            Arc::clone(&storage),
            mediator.clone(),
            NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
        );
        tokio::spawn(worker.run(receivers.application_fetch));
        Fabric {
            mediator,
            receivers_build: receivers.build_session,
            receivers_destroy: receivers.destroy_session,
            storage,
            git,
        }
    }

    async fn fetch(fabric: &Fabric, application: &Arc<Application>, watch_objects: bool) {
        fabric
            .mediator
            .application_fetch
            .enqueue(ApplicationFetchInput {
                application: Arc::clone(application),
                watch_objects,
            })
            .await
            .unwrap();
    }

    /// A fetch that will block on a watch-triggered build RPC must run in
    /// the background so the test can answer the build request.
    fn fetch_in_background(
        fabric: &Fabric,
        application: &Arc<Application>,
        watch_objects: bool,
    ) -> tokio::task::JoinHandle<()> {
        let queue = fabric.mediator.application_fetch.clone();
        let application = Arc::clone(application);
        tokio::spawn(async move {
            queue
                .enqueue(ApplicationFetchInput {
                    application,
                    watch_objects,
                })
                .await
                .unwrap();
        })
    }

    #[tokio::test]
    async fn fetch_builds_total_ref_mapping() {
        let fabric = spawn_fabric();
        fabric.git.set_branch("main", sha("aa"));
        fabric.git.set_tag("v1", sha("aa"));
        let application = test_application_with("fetch-refs", |_| {});

        fetch(&fabric, &application, false).await;

        application.with_git_state(|state| {
            for key in [
                "main",
                "origin/main",
                "refs/heads/main",
                "v1",
                "refs/tags/v1",
                sha("aa").as_str(),
            ] {
                assert_eq!(
                    state.objects_to_hash_map.get(key),
                    Some(&sha("aa")),
                    "missing mapping for {key}"
                );
            }
            let object = state.hash_to_objects_map.get(&sha("aa")).unwrap();
            assert_eq!(object.branches, vec!["main"]);
            assert_eq!(object.tags, vec!["v1"]);
            assert!(state.branches.contains_key("main"));
            assert_eq!(state.tags, vec!["v1"]);
            assert_eq!(state.commits, vec![sha("aa")]);
            assert!(state.commit_map.contains_key(&sha("aa")));
        });
    }

    #[tokio::test]
    async fn refetch_with_no_upstream_changes_is_idempotent() {
        let mut fabric = spawn_fabric();
        fabric.git.set_branch("main", sha("aa"));
        let application = test_application_with("fetch-idem", |conf| {
            conf.watch = vec!["main".to_string()];
        });

        // The first fetch auto-starts the watched ref; answer that build
        // request with a fake alive session so the second fetch sees an
        // up-to-date one.
        let first_fetch = fetch_in_background(&fabric, &application, true);
        let (input, reply) = fabric.receivers_build.recv().await.unwrap();
        let session = Session::new(Arc::clone(&input.application), input.checkout.clone());
        session.set_commit(sha("aa"), None);
        fabric.storage.add(Arc::clone(&session));
        let _ = reply.send(SessionBuildResult::Succeeded { session });
        first_fetch.await.unwrap();
        let first = application.with_git_state(|state| state.objects_to_hash_map.clone());

        fetch(&fabric, &application, true).await;
        let second = application.with_git_state(|state| state.objects_to_hash_map.clone());

        assert_eq!(first, second);
        // No rebuild was triggered.
        assert!(fabric.receivers_build.try_recv().is_err());
    }

    #[tokio::test]
    async fn watched_ref_without_session_auto_starts() {
        let mut fabric = spawn_fabric();
        fabric.git.set_branch("main", sha("aa"));
        let application = test_application_with("fetch-autostart", |conf| {
            conf.watch = vec!["main".to_string()];
        });

        let fetch_task = fetch_in_background(&fabric, &application, true);

        let (input, reply) =
            tokio::time::timeout(Duration::from_secs(5), fabric.receivers_build.recv())
                .await
                .expect("auto-start build was never requested")
                .unwrap();
        assert_eq!(input.checkout, "main");
        assert!(input.previous_session.is_none());

        let session = Session::new(Arc::clone(&input.application), input.checkout.clone());
        let _ = reply.send(SessionBuildResult::Succeeded { session });
        fetch_task.await.unwrap();
    }

    #[tokio::test]
    async fn moved_watched_tip_destroys_and_chains_rebuild() {
        let fabric = spawn_fabric();
        fabric.git.set_branch("main", sha("aa"));
        let application = test_application_with("fetch-hotswap", |conf| {
            conf.watch = vec!["main".to_string()];
        });

        // An alive session on the old tip.
        let session = Session::new(Arc::clone(&application), "main");
        session.set_commit(sha("aa"), None);
        fabric.storage.add(Arc::clone(&session));

        // Upstream advances.
        fabric.git.set_branch("main", sha("bb"));
        fetch(&fabric, &application, true).await;

        let mut destroy_rx = fabric.receivers_destroy;
        let destroyed = tokio::time::timeout(Duration::from_secs(5), destroy_rx.recv())
            .await
            .expect("destroy was never requested")
            .unwrap();
        assert_eq!(destroyed.session.uuid, session.uuid);
        assert_eq!(session.kill_reason(), KillReason::Replaced);

        // Completing the destroy callback chains the rebuild.
        let callback = destroyed.on_destroyed.expect("rebuild callback missing");
        callback(Arc::clone(&session));

        let mut build_rx = fabric.receivers_build;
        let (input, _reply) = tokio::time::timeout(Duration::from_secs(5), build_rx.recv())
            .await
            .expect("rebuild was never requested")
            .unwrap();
        assert_eq!(input.checkout, "main");
        assert_eq!(input.previous_session.unwrap().uuid, session.uuid);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_previous_state_intact() {
        let fabric = spawn_fabric();
        fabric.git.set_branch("main", sha("aa"));
        let application = test_application_with("fetch-fail", |_| {});

        fetch(&fabric, &application, false).await;
        fabric.git.fail_fetch(true);
        fabric.git.set_branch("main", sha("bb"));
        fetch(&fabric, &application, false).await;

        // The failed fetch must not have swapped in the new tip.
        assert_eq!(application.resolve_checkout("main"), Some(sha("aa")));
    }
}
