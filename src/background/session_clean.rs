//! Session clean worker.
//!
//! The single finalization point for dead sessions: sets the terminal
//! status, releases the port, deletes the working folder, and frees the
//! session-store slot. Both failed builds (via `start_failed`) and
//! destroys (via `stopped`/`stop_failed`) converge here, so the recycle
//! chain lives here too: a session killed by a build or healthcheck
//! failure is re-enqueued for a recycled build while its retry budget
//! lasts.

use std::sync::Arc;

use crate::mediator::{CleanSessionInput, Mediator, SessionBuildInput, SignalReceiver};
use crate::models::{Session, SessionStatus};
use crate::storage::SessionStore;

use super::ports::PortAllocator;

/// Consumes `Mediator::clean_session`.
pub struct SessionCleanWorker {
    session_storage: Arc<SessionStore>,
    ports: Arc<PortAllocator>,
    mediator: Mediator,
}

impl SessionCleanWorker {
    pub fn new(
        session_storage: Arc<SessionStore>,
        ports: Arc<PortAllocator>,
        mediator: Mediator,
    ) -> Self {
        SessionCleanWorker {
            session_storage,
            ports,
            mediator,
        }
    }

    pub async fn run(self, mut rx: SignalReceiver<CleanSessionInput>) {
        while let Some(input) = rx.recv().await {
            self.clean_session(input).await;
        }
    }

    async fn clean_session(&self, input: CleanSessionInput) {
        let session = input.session;

        // A session can be enqueued for cleaning twice (destroy during
        // build: both the aborted build task and the destroy worker hand it
        // over). The first clean finalizes; later ones are no-ops.
        if !session.status().is_alive() {
            return;
        }

        session.log_info("Cleaning up session");
        finalize_status(&session, input.status);

        let port = session.port();
        if port > 0 {
            self.ports.release(port);
        }

        let folder = session.folder();
        if folder.as_os_str().is_empty() {
            // Build failed before provisioning; nothing on disk.
        } else if let Err(e) = tokio::fs::remove_dir_all(&folder).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            session.log_error(&format!(
                "Could not remove session folder {}: {e}",
                folder.display()
            ));
        }

        self.session_storage.update(&session);
        self.session_storage.delete(session.uuid);
        session.log_info("Session cleaned up");

        self.maybe_recycle(session).await;
    }

    /// Chains a recycled rebuild for sessions killed by build or
    /// healthcheck failures, bounded by the configured retry budget.
    async fn maybe_recycle(&self, session: Arc<Session>) {
        if !session.kill_reason().is_recyclable() {
            return;
        }
        let conf = session.application.configuration();
        if session.startup_retries() >= conf.startup.retries {
            if conf.startup.retries > 0 {
                session.log_error("Startup retries exhausted");
            }
            return;
        }

        session.log_info("Recycling session for a retry build");
        let _ = self
            .mediator
            .build_session
            .enqueue(SessionBuildInput {
                application: Arc::clone(&session.application),
                checkout: session.checkout.clone(),
                previous_session: Some(session),
            })
            .await;
    }
}

/// Applies the requested terminal status, routing through `stopping` when
/// the direct edge is not legal for the session's current status.
fn finalize_status(session: &Arc<Session>, requested: SessionStatus) {
    if session.status().can_transition_to(requested) {
        session.set_status(requested);
        return;
    }
    if session.status().can_transition_to(SessionStatus::Stopping) {
        session.set_status(SessionStatus::Stopping);
    }
    session.set_status(SessionStatus::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::Mediator;
    use crate::models::KillReason;
    use crate::storage::NoopPersistence;
    use crate::test_utils::test_application_with;
    use std::time::Duration;

    struct Fabric {
        mediator: Mediator,
        build_rx: crate::mediator::RequestReceiver<
            SessionBuildInput,
            crate::mediator::SessionBuildResult,
        >,
        storage: Arc<SessionStore>,
        ports: Arc<PortAllocator>,
    }

    fn spawn_fabric() -> Fabric {
        let (mediator, receivers) = Mediator::new();
        let storage = Arc::new(SessionStore::new(Box::new(NoopPersistence)));
        let ports = Arc::new(PortAllocator::new());
        let worker = SessionCleanWorker::new(
            Arc::clone(&storage),
            Arc::clone(&ports),
            mediator.clone(),
        );
        tokio::spawn(worker.run(receivers.clean_session));
        Fabric {
            mediator,
            build_rx: receivers.build_session,
            storage,
            ports,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn clean_releases_port_folder_and_store_slot() {
        let fabric = spawn_fabric();
        let session = Session::new(test_application_with("clean", |_| {}), "main");

        let folder = tempfile::tempdir().unwrap();
        let folder_path = folder.keep();
        session.set_folder(&folder_path);
        session.set_port(45999);
        fabric.ports.release(45999); // not reserved in this test harness
        session.set_status(SessionStatus::Started);
        session.set_status(SessionStatus::Stopping);
        fabric.storage.add(Arc::clone(&session));

        fabric
            .mediator
            .clean_session
            .enqueue(CleanSessionInput {
                session: Arc::clone(&session),
                status: SessionStatus::Stopped,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(!folder_path.exists());
        assert!(fabric.storage.get_by_uuid(session.uuid).is_none());
        assert!(!fabric.ports.is_reserved(45999));
    }

    #[tokio::test]
    async fn second_clean_is_a_no_op() {
        let fabric = spawn_fabric();
        let session = Session::new(test_application_with("clean-twice", |_| {}), "main");
        fabric.storage.add(Arc::clone(&session));

        for status in [SessionStatus::StartFailed, SessionStatus::Stopped] {
            fabric
                .mediator
                .clean_session
                .enqueue(CleanSessionInput {
                    session: Arc::clone(&session),
                    status,
                })
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(session.status(), SessionStatus::StartFailed);
    }

    #[tokio::test]
    async fn recyclable_session_is_re_enqueued_for_build() {
        let mut fabric = spawn_fabric();
        let application = test_application_with("clean-recycle", |conf| {
            conf.startup.retries = 2;
        });
        let session = Session::new(application, "main");
        session.set_kill_reason(KillReason::HealthcheckFailed);
        session.set_status(SessionStatus::Stopping);
        fabric.storage.add(Arc::clone(&session));

        fabric
            .mediator
            .clean_session
            .enqueue(CleanSessionInput {
                session: Arc::clone(&session),
                status: SessionStatus::Stopped,
            })
            .await
            .unwrap();

        let (build, reply) =
            tokio::time::timeout(Duration::from_secs(5), fabric.build_rx.recv())
                .await
                .expect("recycled build was never enqueued")
                .unwrap();
        assert_eq!(build.checkout, "main");
        assert_eq!(
            build.previous_session.as_ref().unwrap().uuid,
            session.uuid
        );
        let _ = reply;
    }

    #[tokio::test]
    async fn exhausted_retry_budget_stops_recycling() {
        let mut fabric = spawn_fabric();
        let application = test_application_with("clean-exhausted", |conf| {
            conf.startup.retries = 1;
        });
        let session = Session::new(application, "main");
        session.reset_for_recycle(); // startup_retries = 1 = budget
        session.set_kill_reason(KillReason::BuildFailed);
        fabric.storage.add(Arc::clone(&session));

        fabric
            .mediator
            .clean_session
            .enqueue(CleanSessionInput {
                session: Arc::clone(&session),
                status: SessionStatus::StartFailed,
            })
            .await
            .unwrap();
        settle().await;

        assert!(fabric.build_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_kill_reason_is_not_recycled() {
        let mut fabric = spawn_fabric();
        let application = test_application_with("clean-stopped", |conf| {
            conf.startup.retries = 5;
        });
        let session = Session::new(application, "main");
        session.set_kill_reason(KillReason::Stopped);
        session.set_status(SessionStatus::Stopping);
        fabric.storage.add(Arc::clone(&session));

        fabric
            .mediator
            .clean_session
            .enqueue(CleanSessionInput {
                session: Arc::clone(&session),
                status: SessionStatus::Stopped,
            })
            .await
            .unwrap();
        settle().await;

        assert!(fabric.build_rx.try_recv().is_err());
    }
}
