//! Session filesystem worker.
//!
//! Provisions per-commit working trees under
//! `<sessionsFolder>/<app>/<sha>/`, cloning (hard-linking where possible)
//! from the application's canonical tree and checking out the exact SHA.
//!
//! Provisioning serializes per application: concurrent builds targeting the
//! same application queue behind one lazily-created provisioner task, while
//! different applications never block each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::mediator::RequestReceiver;
use crate::models::Session;
use crate::versioning::{GitClient, GitError};

type ProvisionRequest = (Arc<Session>, oneshot::Sender<Result<PathBuf, GitError>>);

/// Consumes `Mediator::session_filesystem`.
pub struct SessionFileSystemWorker {
    git: Arc<dyn GitClient>,
}

impl SessionFileSystemWorker {
    pub fn new(git: Arc<dyn GitClient>) -> Self {
        SessionFileSystemWorker { git }
    }

    /// Worker loop: forwards each request to its application's provisioner
    /// task, creating the task on first use.
    pub async fn run(self, mut rx: RequestReceiver<Arc<Session>, Result<PathBuf, GitError>>) {
        let mut provisioners: HashMap<String, mpsc::Sender<ProvisionRequest>> = HashMap::new();

        while let Some((session, reply)) = rx.recv().await {
            let name = session.application_name.clone();
            let provisioner = provisioners.entry(name.clone()).or_insert_with(|| {
                debug!(application = %name, "Spawning filesystem provisioner");
                let (tx, task_rx) = mpsc::channel::<ProvisionRequest>(1);
                let git = Arc::clone(&self.git);
                tokio::spawn(provision_loop(git, task_rx));
                tx
            });
            if provisioner.send((session, reply)).await.is_err() {
                // Dropping the reply surfaces the failure to the builder;
                // the next request gets a fresh provisioner.
                provisioners.remove(&name);
            }
        }
    }
}

/// FIFO provisioning for one application.
async fn provision_loop(git: Arc<dyn GitClient>, mut rx: mpsc::Receiver<ProvisionRequest>) {
    while let Some((session, reply)) = rx.recv().await {
        let _ = reply.send(provision(&git, &session).await);
    }
}

async fn provision(git: &Arc<dyn GitClient>, session: &Arc<Session>) -> Result<PathBuf, GitError> {
    let Some(commit_id) = session.commit_id() else {
        return Err(GitError::ObjectNotFound {
            object: format!("session {} has no resolved commit", session.short_uuid),
        });
    };
    let application = &session.application;
    let commit_folder = application.sessions_folder.join(commit_id.as_str());

    session.log_info(&format!(
        "Preparing commit folder {}",
        commit_folder.display()
    ));
    git.provision_commit_tree(&application.base_folder, &commit_folder, &commit_id)
        .await?;
    Ok(commit_folder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::Mediator;
    use crate::test_utils::{MockGitClient, sha, test_application};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn provisions_commit_folder_for_resolved_session() {
        let (mediator, receivers) = Mediator::new();
        let git = MockGitClient::new();
        let worker = SessionFileSystemWorker::new(git.clone());
        tokio::spawn(worker.run(receivers.session_filesystem));

        let application = test_application("fs-app");
        let session = Session::new(Arc::clone(&application), "main");
        session.set_commit(sha("ab"), None);

        let folder = mediator
            .session_filesystem
            .enqueue(session)
            .await
            .unwrap()
            .unwrap();

        assert!(folder.ends_with(format!("fs-app/{}", sha("ab"))));
        assert_eq!(git.provision_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolved_session_is_rejected() {
        let (mediator, receivers) = Mediator::new();
        let worker = SessionFileSystemWorker::new(MockGitClient::new());
        tokio::spawn(worker.run(receivers.session_filesystem));

        let session = Session::new(test_application("fs-unresolved"), "main");
        let result = mediator.session_filesystem.enqueue(session).await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn provisioning_failure_propagates() {
        let (mediator, receivers) = Mediator::new();
        let git = MockGitClient::new();
        git.fail_provision(true);
        let worker = SessionFileSystemWorker::new(git);
        tokio::spawn(worker.run(receivers.session_filesystem));

        let session = Session::new(test_application("fs-fail"), "main");
        session.set_commit(sha("ab"), None);

        let result = mediator.session_filesystem.enqueue(session).await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn requests_for_different_applications_both_complete() {
        let (mediator, receivers) = Mediator::new();
        let git = MockGitClient::new();
        let worker = SessionFileSystemWorker::new(git.clone());
        tokio::spawn(worker.run(receivers.session_filesystem));

        let one = Session::new(test_application("fs-one"), "main");
        one.set_commit(sha("01"), None);
        let two = Session::new(test_application("fs-two"), "main");
        two.set_commit(sha("02"), None);

        let (first, second) = tokio::join!(
            mediator.session_filesystem.enqueue(one),
            mediator.session_filesystem.enqueue(two),
        );
        assert!(first.unwrap().is_ok());
        assert!(second.unwrap().is_ok());
        assert_eq!(git.provision_count.load(Ordering::SeqCst), 2);
    }
}
