//! Session destroy worker.
//!
//! Runs the configured stop commands with a bounded overall timeout,
//! terminates any surviving child process tree (group SIGTERM, then
//! SIGKILL), invokes the optional post-destroy continuation, and hands the
//! session to the clean worker with its terminal status. Destroy always
//! completes: errors downgrade the terminal status to `stop_failed` but
//! never abandon the session.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mediator::{CleanSessionInput, DestroySessionInput, Mediator, SignalReceiver};
use crate::models::{KillReason, Session, SessionStatus};
use crate::storage::SessionStore;

use super::command::{exec_command, terminate_process_group};

/// Overall bound on the stop-command phase.
const STOP_COMMANDS_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace between SIGTERM and SIGKILL for surviving process groups.
const PROCESS_KILL_GRACE: Duration = Duration::from_secs(5);

/// Consumes `Mediator::destroy_session`.
pub struct SessionDestroyWorker {
    session_storage: Arc<SessionStore>,
    mediator: Mediator,
}

impl SessionDestroyWorker {
    pub fn new(session_storage: Arc<SessionStore>, mediator: Mediator) -> Self {
        SessionDestroyWorker {
            session_storage,
            mediator,
        }
    }

    pub async fn run(self, mut rx: SignalReceiver<DestroySessionInput>) {
        while let Some(input) = rx.recv().await {
            self.destroy_session(input).await;
        }
    }

    async fn destroy_session(&self, input: DestroySessionInput) {
        let session = Arc::clone(&input.session);
        session.log_info("Destroying session");

        if session.kill_reason() == KillReason::None {
            session.set_kill_reason(KillReason::Stopped);
        }

        // Interrupt any in-flight build or healthcheck for this session.
        session.cancel_scopes();

        if session.status().is_alive() {
            session.set_status(SessionStatus::Stopping);
            self.session_storage.update(&session);
        }

        let stop_failed = self.exec_stop_commands(&session).await;

        for pgid in session.tracked_process_groups() {
            terminate_process_group(pgid, PROCESS_KILL_GRACE).await;
        }

        if let Some(callback) = input.on_destroyed {
            callback(Arc::clone(&session));
        }

        let status = if stop_failed {
            SessionStatus::StopFailed
        } else {
            SessionStatus::Stopped
        };
        let _ = self
            .mediator
            .clean_session
            .enqueue(CleanSessionInput { session, status })
            .await;
    }

    /// Runs the stop commands; returns true when a non-tolerated failure
    /// occurred.
    async fn exec_stop_commands(&self, session: &Arc<Session>) -> bool {
        let conf = session.application.configuration();
        if conf.commands.stop.is_empty() {
            return false;
        }

        let scope = CancellationToken::new();
        let watchdog = {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STOP_COMMANDS_TIMEOUT).await;
                scope.cancel();
            })
        };

        let mut stop_failed = false;
        for command in &conf.commands.stop {
            if scope.is_cancelled() {
                session.log_error("Stop commands timed out");
                stop_failed = true;
                break;
            }
            if let Err(e) = exec_command(session, command, &scope).await {
                session.log_error(&format!("Stop command failed: {e}"));
                if !command.continue_on_error {
                    stop_failed = true;
                    break;
                }
            }
        }

        watchdog.abort();
        stop_failed
    }
}
