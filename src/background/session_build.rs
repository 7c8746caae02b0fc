//! Session build worker.
//!
//! Accepts build requests over the mediator, enforces concurrency
//! admission, deduplicates against in-flight builds, and spawns one build
//! task per accepted session. The build task provisions the working tree,
//! runs the start commands and warmups, then hands the session to the
//! healthcheck worker or marks it started directly.
//!
//! A command flagged `start_healthchecking` overlaps healthchecking with
//! the remaining commands: the healthcheck may flip the session to
//! `started` while later commands still execute.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{ApplicationConfiguration, GlobalConfiguration, Warmup, Warmups};
use crate::mediator::{
    CleanSessionInput, FailingReason, Mediator, RequestReceiver, SessionBuildInput,
    SessionBuildResult,
};
use crate::models::{ContextKey, KillReason, Session, SessionStatus};
use crate::storage::SessionStore;

use super::command::{CommandError, exec_command};
use super::ports::PortAllocator;

/// Why a build task aborted before completion.
enum BuildAbort {
    /// The session left the set of states that permit building; treated as
    /// cooperative cancellation.
    WrongSessionState,

    /// The build scope was cancelled (destroy during build) or the startup
    /// timeout expired.
    Cancelled,

    /// Working-tree provisioning failed.
    Filesystem(String),

    /// A start command failed without `continue_on_error`.
    Command(CommandError),
}

/// Consumes `Mediator::build_session`.
pub struct SessionBuildWorker {
    global: GlobalConfiguration,
    session_storage: Arc<SessionStore>,
    ports: Arc<PortAllocator>,
    mediator: Mediator,
    http: reqwest::Client,
}

impl SessionBuildWorker {
    pub fn new(
        global: GlobalConfiguration,
        session_storage: Arc<SessionStore>,
        ports: Arc<PortAllocator>,
        mediator: Mediator,
    ) -> Self {
        SessionBuildWorker {
            global,
            session_storage,
            ports,
            mediator,
            http: reqwest::Client::new(),
        }
    }

    /// Worker loop: serializes admission; builds themselves run as spawned
    /// tasks with bounded concurrency enforced by admission, not queue
    /// depth.
    pub async fn run(self, mut rx: RequestReceiver<SessionBuildInput, SessionBuildResult>) {
        let worker = Arc::new(self);
        while let Some((input, reply)) = rx.recv().await {
            let result = worker.accept_session_build(input).await;
            let _ = reply.send(result);
        }
    }

    async fn accept_session_build(self: &Arc<Self>, input: SessionBuildInput) -> SessionBuildResult {
        let application = Arc::clone(&input.application);
        let conf = application.configuration();

        // Admission control.
        if self.session_storage.alive_count() >= self.global.max_concurrent_sessions {
            return SessionBuildResult::failed(
                FailingReason::GlobalConcurrencyExceeded,
                "Reached global maximum concurrent sessions",
            );
        }
        if self.session_storage.alive_by_application_count(&application)
            >= conf.max_concurrent_sessions
        {
            return SessionBuildResult::failed(
                FailingReason::ApplicationConcurrencyExceeded,
                "Reached maximum concurrent sessions for this application",
            );
        }

        // Previous-session treatment: recycle failed builds, link
        // replacements, otherwise build fresh.
        let mut based_on_previous_session = false;
        let mut recycling = false;
        let mut is_a_replacement = false;
        if let Some(previous) = &input.previous_session {
            based_on_previous_session = true;
            match previous.kill_reason() {
                reason if reason.is_recyclable() => recycling = true,
                KillReason::Replaced => is_a_replacement = true,
                _ => {}
            }
        }

        let session = match &input.previous_session {
            Some(previous) if recycling => {
                previous.reset_for_recycle();
                Arc::clone(previous)
            }
            _ => Session::new(Arc::clone(&application), input.checkout.clone()),
        };

        if is_a_replacement
            && let Some(previous) = &input.previous_session
        {
            session.set_replaces(previous);
        }

        let Some(commit_id) = application.resolve_checkout(&input.checkout) else {
            return SessionBuildResult::failed(
                FailingReason::CheckoutUnknown,
                format!(
                    "Could not find the hash of the selected checkout {}",
                    input.checkout
                ),
            );
        };

        session.log_info(&format!("Creating session {}", session.uuid));

        let port = match self.ports.allocate(&conf.port) {
            Ok(port) => port,
            Err(e) => {
                error!(error = %e, "Could not get a free port");
                return SessionBuildResult::failed(
                    FailingReason::PortUnavailable,
                    "Could not get a free port",
                );
            }
        };
        session.set_port(port);
        session.log_info(&format!("Found new free port: {port}"));

        session.set_commit(commit_id.clone(), application.commit_details(&commit_id));
        session.log_info(&format!(
            "Requested checkout to {} ({commit_id})",
            input.checkout
        ));

        if !based_on_previous_session {
            // Collapse concurrent requests for the same (application,
            // commit) onto the session already being built.
            if let Some(existing) = self
                .session_storage
                .get_alive_application_session_by_checkout(&commit_id, &application)
            {
                session.log_warn(&format!(
                    "Another session with the UUID {} has already being requested for checkout {}",
                    existing.uuid, input.checkout
                ));
                self.ports.release(port);
                return SessionBuildResult::Succeeded { session: existing };
            }
        }

        let target = conf.target.replace("{{port}}", &port.to_string());
        session.set_target(target.clone());
        session.log_info(&format!("Setting session target to {target}"));

        session.set_variable("uuid", session.uuid.to_string());
        session.set_variable("name", session.application_name.clone());
        session.set_variable("port", port.to_string());
        session.set_variable("target", target);
        session.set_variable("commit", commit_id.to_string());

        // Insert before spawning, so observers see the session before it
        // produces output.
        self.session_storage.add(Arc::clone(&session));

        let worker = Arc::clone(self);
        let build_session = Arc::clone(&session);
        tokio::spawn(async move {
            worker.build_session(build_session).await;
        });

        SessionBuildResult::Succeeded { session }
    }

    /// The per-session build task, scoped by the startup timeout and the
    /// session's named build scope.
    async fn build_session(self: Arc<Self>, session: Arc<Session>) {
        let conf = session.application.configuration();
        let scope = session.register_scope(ContextKey::Build);

        // The command scope trips on external cancellation (via the parent)
        // or on startup-timeout expiry (via the watchdog task).
        let deadline = scope.child_token();
        let watchdog = {
            let deadline = deadline.clone();
            let timeout = Duration::from_secs(conf.startup.timeout);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let outcome = self.run_build_phases(&session, &conf, &deadline).await;

        watchdog.abort();
        session.release_scope(ContextKey::Build);

        if let Err(abort) = outcome {
            match abort {
                BuildAbort::WrongSessionState => {
                    if session.kill_reason() == KillReason::None {
                        session.set_kill_reason(KillReason::Stopped);
                    } else {
                        session.log_trace("Commands: it has been killed by the user, right?");
                    }
                }
                BuildAbort::Cancelled => {
                    if session.kill_reason() == KillReason::None {
                        session.set_kill_reason(KillReason::BuildFailed);
                    }
                }
                BuildAbort::Filesystem(message) => {
                    session
                        .log_error(&format!("Could not build session commit structure: {message}"));
                    session.set_kill_reason(KillReason::BuildFailed);
                }
                BuildAbort::Command(e) => {
                    session.log_error(&e.to_string());
                    if session.kill_reason() == KillReason::None {
                        session.set_kill_reason(KillReason::BuildFailed);
                    }
                }
            }
            session.log_error("Execution aborted");
            let _ = self
                .mediator
                .clean_session
                .enqueue(CleanSessionInput {
                    session,
                    status: SessionStatus::StartFailed,
                })
                .await;
        }
    }

    async fn run_build_phases(
        &self,
        session: &Arc<Session>,
        conf: &ApplicationConfiguration,
        scope: &CancellationToken,
    ) -> Result<(), BuildAbort> {
        let build_metric = session.start_metric("Build (total)");

        self.prepare_folders(session).await?;
        self.session_storage.update(session);

        let healthchecking_started = self.exec_commands(session, conf, scope).await?;

        if !conf.warmup.urls.is_empty() {
            self.exec_warmups(session, conf, scope).await?;
        }

        drop(build_metric);
        self.session_storage.update(session);

        match &conf.healthcheck {
            None => {
                if session.status() != SessionStatus::Started {
                    let _ = self.mediator.start_session.enqueue(Arc::clone(session)).await;
                }
                session.log_info("Session started");
            }
            Some(_) if !healthchecking_started => {
                let _ = self
                    .mediator
                    .healthcheck_session
                    .enqueue(Arc::clone(session))
                    .await;
            }
            Some(_) => {}
        }

        Ok(())
    }

    async fn prepare_folders(&self, session: &Arc<Session>) -> Result<(), BuildAbort> {
        let _metric = session.start_metric("Prepare folder");
        match self
            .mediator
            .session_filesystem
            .enqueue(Arc::clone(session))
            .await
        {
            Ok(Ok(commit_folder)) => {
                session.set_folder(commit_folder);
                Ok(())
            }
            Ok(Err(e)) => Err(BuildAbort::Filesystem(e.to_string())),
            Err(e) => Err(BuildAbort::Filesystem(e.to_string())),
        }
    }

    /// Runs the start commands in order. Returns whether healthchecking was
    /// already kicked off by a `start_healthchecking` command.
    async fn exec_commands(
        &self,
        session: &Arc<Session>,
        conf: &ApplicationConfiguration,
        scope: &CancellationToken,
    ) -> Result<bool, BuildAbort> {
        let _metric = session.start_metric("Startup commands");
        let mut healthchecking_started = false;

        for command in &conf.commands.start {
            if scope.is_cancelled() {
                return Err(BuildAbort::Cancelled);
            }

            // Command execution is permitted while the session is building
            // or already available.
            let status = session.status();
            if status != SessionStatus::Starting && status != SessionStatus::Started {
                return Err(BuildAbort::WrongSessionState);
            }

            match exec_command(session, command, scope).await {
                Err(CommandError::Cancelled) => return Err(BuildAbort::Cancelled),
                Err(e) => {
                    if !command.continue_on_error {
                        return Err(BuildAbort::Command(e));
                    }
                    session.log_error(&e.to_string());
                }
                Ok(()) => {
                    self.session_storage.update(session);
                    if command.start_healthchecking
                        && !healthchecking_started
                        && conf.healthcheck.is_some()
                    {
                        let _ = self
                            .mediator
                            .healthcheck_session
                            .enqueue(Arc::clone(session))
                            .await;
                        healthchecking_started = true;
                    }
                }
            }
        }
        Ok(healthchecking_started)
    }

    /// Issues the warmup requests sequentially. A warmup failure is logged
    /// but never fails the session.
    async fn exec_warmups(
        &self,
        session: &Arc<Session>,
        conf: &ApplicationConfiguration,
        scope: &CancellationToken,
    ) -> Result<(), BuildAbort> {
        let _metric = session.start_metric("Warmup");
        tokio::time::sleep(Duration::from_secs(1)).await;

        for warmup in &conf.warmup.urls {
            if scope.is_cancelled() {
                return Err(BuildAbort::Cancelled);
            }
            let status = session.status();
            if status != SessionStatus::Starting && status != SessionStatus::Started {
                return Err(BuildAbort::WrongSessionState);
            }

            if let Err((url, message)) = self
                .exec_warmup(session, conf, warmup, &conf.warmup, scope)
                .await
            {
                session.log_error(&format!("Cannot execute warmup of URL {url}: {message}"));
            }
        }
        Ok(())
    }

    async fn exec_warmup(
        &self,
        session: &Arc<Session>,
        conf: &ApplicationConfiguration,
        warmup: &Warmup,
        warmups: &Warmups,
        scope: &CancellationToken,
    ) -> Result<(), (String, String)> {
        let url = session.apply_variables(&warmup.url);
        let method = reqwest::Method::from_bytes(warmup.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut retry_count = 0;
        loop {
            session.log_trace(&format!("Requesting warmup URL {url}"));

            let mut request = self.http.request(method.clone(), &url);
            // timeout 0 picks the 60s default; negative disables it.
            match warmup.timeout {
                0 => request = request.timeout(Duration::from_secs(60)),
                timeout if timeout > 0 => {
                    request = request.timeout(Duration::from_secs(timeout as u64));
                }
                _ => {}
            }
            for (name, value) in conf.headers.pairs() {
                request = request.header(name, value);
            }
            if let Some(host) = &conf.host
                && let Ok(value) = HeaderValue::from_str(host)
            {
                request = request.header(reqwest::header::HOST, value);
            }

            let failure = match request.send().await {
                Ok(response) if response.status().as_u16() == warmup.status => return Ok(()),
                Ok(response) => format!(
                    "received status code {}, wanted {}",
                    response.status().as_u16(),
                    warmup.status
                ),
                Err(e) => e.to_string(),
            };
            session.log_trace(&format!("Warmup error: {failure}"));

            retry_count += 1;
            if retry_count >= warmups.max_retries {
                return Err((url, "warmup did not return successful status code".to_string()));
            }

            tokio::select! {
                _ = scope.cancelled() => return Err((url, "cancelled".to_string())),
                _ = tokio::time::sleep(Duration::from_secs(warmups.retry_interval)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::MediatorReceivers;
    use crate::storage::NoopPersistence;
    use crate::test_utils::{sha, test_application_with};
    use crate::models::ApplicationGitState;

    struct Harness {
        mediator: Mediator,
        storage: Arc<SessionStore>,
        ports: Arc<PortAllocator>,
    }

    /// Spawns the build worker plus stubs for the queues a build touches:
    /// a filesystem worker replying with a temp folder, and drains for the
    /// fire-and-forget queues.
    fn harness(global_max: usize) -> Harness {
        let (mediator, receivers) = Mediator::new();
        let MediatorReceivers {
            build_session,
            mut session_filesystem,
            mut start_session,
            mut healthcheck_session,
            mut clean_session,
            ..
        } = receivers;

        let storage = Arc::new(SessionStore::new(Box::new(NoopPersistence)));
        let ports = Arc::new(PortAllocator::new());

        let global = GlobalConfiguration {
            max_concurrent_sessions: global_max,
            ..Default::default()
        };
        let worker = SessionBuildWorker::new(
            global,
            Arc::clone(&storage),
            Arc::clone(&ports),
            mediator.clone(),
        );
        tokio::spawn(worker.run(build_session));

        tokio::spawn(async move {
            while let Some((session, reply)) = session_filesystem.recv().await {
                let folder = std::env::temp_dir()
                    .join("polo-build-tests")
                    .join(session.uuid.to_string());
                std::fs::create_dir_all(&folder).unwrap();
                let _ = reply.send(Ok(folder));
            }
        });
        tokio::spawn(async move { while start_session.recv().await.is_some() {} });
        tokio::spawn(async move { while healthcheck_session.recv().await.is_some() {} });
        tokio::spawn(async move { while clean_session.recv().await.is_some() {} });

        Harness {
            mediator,
            storage,
            ports,
        }
    }

    fn watched_application(name: &str) -> Arc<crate::models::Application> {
        let application = test_application_with(name, |_| {});
        let mut state = ApplicationGitState::default();
        state
            .objects_to_hash_map
            .insert("main".to_string(), sha("aa"));
        application.replace_git_state(state);
        application
    }

    async fn request(
        harness: &Harness,
        application: &Arc<crate::models::Application>,
    ) -> SessionBuildResult {
        harness
            .mediator
            .build_session
            .enqueue(SessionBuildInput {
                application: Arc::clone(application),
                checkout: "main".to_string(),
                previous_session: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn build_seeds_variables_and_placement() {
        let h = harness(10);
        let application = watched_application("build-vars");

        let result = request(&h, &application).await;
        let session = result.session().unwrap();

        assert!(session.port() > 0);
        assert!(session.target().contains(&session.port().to_string()));
        let variables = session.variables();
        assert_eq!(variables.get("commit"), Some(sha("aa").as_str()));
        assert_eq!(variables.get("name"), Some("build-vars"));
        assert_eq!(variables.get("uuid"), Some(session.uuid.to_string().as_str()));
        assert_eq!(
            variables.get("port"),
            Some(session.port().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn unknown_checkout_fails_the_build() {
        let h = harness(10);
        let application = test_application_with("unknown-checkout", |_| {});

        let result = request(&h, &application).await;
        let SessionBuildResult::Failed { reason, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailingReason::CheckoutUnknown);
    }

    #[tokio::test]
    async fn zero_application_cap_denies_all_builds() {
        let h = harness(10);
        let application = test_application_with("capped", |conf| {
            conf.max_concurrent_sessions = 0;
        });

        let result = request(&h, &application).await;
        let SessionBuildResult::Failed { reason, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailingReason::ApplicationConcurrencyExceeded);
    }

    #[tokio::test]
    async fn zero_global_cap_denies_all_builds() {
        let h = harness(0);
        let application = watched_application("global-capped");

        let result = request(&h, &application).await;
        let SessionBuildResult::Failed { reason, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailingReason::GlobalConcurrencyExceeded);
    }

    #[tokio::test]
    async fn duplicate_build_collapses_to_one_session() {
        let h = harness(10);
        let application = watched_application("dedup");

        let first = request(&h, &application).await;
        let second = request(&h, &application).await;

        let first_uuid = first.session().unwrap().uuid;
        let second_uuid = second.session().unwrap().uuid;
        assert_eq!(first_uuid, second_uuid);
        assert_eq!(h.storage.get_all_alive_sessions().len(), 1);
    }

    #[tokio::test]
    async fn dedup_releases_the_second_port() {
        let h = harness(10);
        let application = watched_application("dedup-port");

        let first = request(&h, &application).await;
        let first_port = first.session().unwrap().port();
        let second = request(&h, &application).await;
        let second_port = second.session().unwrap().port();

        assert_eq!(first_port, second_port);
        // Exactly one reservation outstanding.
        assert!(h.ports.is_reserved(first_port));
    }
}
