//! Session healthcheck worker.
//!
//! Polls the configured URL for each session handed to it. While a session
//! is `starting`, the first success flips it to `started` (through the
//! start worker). While it is `started`, a failure degrades it; once the
//! failure budget is exhausted the session is killed with reason
//! `healthcheck_failed` and destroyed, which feeds the recycle path.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderValue;
use tokio_util::sync::CancellationToken;

use crate::config::Healthcheck;
use crate::mediator::{DestroySessionInput, Mediator, SignalReceiver};
use crate::models::{ContextKey, KillReason, Session, SessionStatus};
use crate::storage::SessionStore;

/// Consumes `Mediator::healthcheck_session`.
pub struct SessionHealthcheckWorker {
    session_storage: Arc<SessionStore>,
    mediator: Mediator,
    http: reqwest::Client,
}

impl SessionHealthcheckWorker {
    pub fn new(session_storage: Arc<SessionStore>, mediator: Mediator) -> Self {
        SessionHealthcheckWorker {
            session_storage,
            mediator,
            http: reqwest::Client::new(),
        }
    }

    /// Worker loop: each session gets its own polling task, bounded by the
    /// session's named healthcheck scope.
    pub async fn run(self, mut rx: SignalReceiver<Arc<Session>>) {
        let worker = Arc::new(self);
        while let Some(session) = rx.recv().await {
            let Some(healthcheck) = session.application.configuration().healthcheck else {
                continue;
            };
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                worker.poll_session(session, healthcheck).await;
            });
        }
    }

    async fn poll_session(self: Arc<Self>, session: Arc<Session>, healthcheck: Healthcheck) {
        let scope = session.register_scope(ContextKey::Healthcheck);
        let mut retries: u32 = 0;

        loop {
            let status = session.status();
            if !status.is_alive() || status == SessionStatus::Stopping {
                break;
            }

            let healthy = self.probe(&session, &healthcheck).await;

            if healthy {
                retries = 0;
                match session.status() {
                    SessionStatus::Starting => {
                        session.log_info("Session healthy");
                        let _ = self
                            .mediator
                            .start_session
                            .enqueue(Arc::clone(&session))
                            .await;
                    }
                    SessionStatus::Degraded => {
                        session.log_info("Session recovered");
                        session.set_status(SessionStatus::Started);
                        self.session_storage.update(&session);
                    }
                    _ => {}
                }
            } else {
                retries += 1;

                if session.status() == SessionStatus::Started {
                    session.log_warn("Session degraded");
                    session.set_status(SessionStatus::Degraded);
                    self.session_storage.update(&session);
                }

                if retries >= healthcheck.max_retries {
                    session.log_error("Healthcheck retries exhausted");
                    session.set_kill_reason(KillReason::HealthcheckFailed);
                    let _ = self
                        .mediator
                        .destroy_session
                        .enqueue(DestroySessionInput::new(Arc::clone(&session)))
                        .await;
                    break;
                }
            }

            if wait_or_cancelled(&scope, Duration::from_secs(healthcheck.retry_interval)).await {
                break;
            }
        }

        session.release_scope(ContextKey::Healthcheck);
    }

    /// One probe; true when the response status matches the expectation.
    async fn probe(&self, session: &Arc<Session>, healthcheck: &Healthcheck) -> bool {
        let url = session.apply_variables(&healthcheck.url);
        let method = reqwest::Method::from_bytes(healthcheck.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self
            .http
            .request(method, &url)
            .timeout(Duration::from_secs(healthcheck.timeout));
        for (name, value) in healthcheck.headers.pairs() {
            request = request.header(name, value);
        }
        let conf = session.application.configuration();
        if let Some(host) = &conf.host
            && let Ok(value) = HeaderValue::from_str(host)
        {
            request = request.header(reqwest::header::HOST, value);
        }

        match request.send().await {
            Ok(response) if response.status().as_u16() == healthcheck.status => true,
            Ok(response) => {
                session.log_trace(&format!(
                    "Healthcheck: received status code {}, wanted {}",
                    response.status().as_u16(),
                    healthcheck.status
                ));
                false
            }
            Err(e) => {
                session.log_trace(&format!("Healthcheck error: {e}"));
                false
            }
        }
    }
}

/// Sleeps for `interval`; returns true when the scope was cancelled first.
async fn wait_or_cancelled(scope: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = scope.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}
