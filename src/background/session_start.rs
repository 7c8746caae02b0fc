//! Session start worker.
//!
//! Marks sessions as started and arms the inactivity timer. Sessions on a
//! watched ref are pinned (`max_age = -1`) and never age out; every other
//! session gets a one-second-tick timer that enqueues a destroy once the
//! inactivity deadline passes. `inactive_at` is the authoritative deadline;
//! the decrementing `max_age` is cosmetic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::mediator::{DestroySessionInput, Mediator, SignalReceiver};
use crate::models::{Session, SessionStatus};
use crate::storage::SessionStore;

/// Consumes `Mediator::start_session`.
pub struct SessionStartWorker {
    session_storage: Arc<SessionStore>,
    mediator: Mediator,
}

impl SessionStartWorker {
    pub fn new(session_storage: Arc<SessionStore>, mediator: Mediator) -> Self {
        SessionStartWorker {
            session_storage,
            mediator,
        }
    }

    pub async fn run(self, mut rx: SignalReceiver<Arc<Session>>) {
        let worker = Arc::new(self);
        while let Some(session) = rx.recv().await {
            worker.mark_session_as_started(session);
        }
    }

    fn mark_session_as_started(self: &Arc<Self>, session: Arc<Session>) {
        session.set_status(SessionStatus::Started);
        session.reset_startup_retries();

        if session.application.is_watched(&session.checkout) {
            session.set_max_age(-1);
        } else {
            let inactivity_timeout = session.application.configuration().recycle.inactivity_timeout;
            session.set_max_age(inactivity_timeout as i64);
            self.start_session_inactivity_timer(&session, inactivity_timeout);
        }

        self.session_storage.update(&session);
    }

    fn start_session_inactivity_timer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        inactivity_timeout: u64,
    ) {
        session.set_inactive_at(Utc::now() + chrono::Duration::seconds(inactivity_timeout as i64));
        let worker = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                if session.status() != SessionStatus::Started {
                    return;
                }
                if Utc::now() > session.inactive_at() {
                    debug!(session = %session.short_uuid, "Inactivity deadline passed");
                    let _ = worker
                        .mediator
                        .destroy_session
                        .enqueue(DestroySessionInput::new(session))
                        .await;
                    return;
                }
                session.decrease_max_age();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}
