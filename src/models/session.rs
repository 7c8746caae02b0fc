//! Per-session state.
//!
//! A session is one running build+serve instance of an application at a
//! specific commit. It owns a working directory, a TCP port, and an external
//! child process tree. All mutable state lives behind a single mutex; no
//! caller ever observes a half-updated session.
//!
//! # Status machine
//!
//! ```text
//!             ┌─────────┐
//!    new ──►  │starting │ ──command-fail/timeout──► start_failed
//!             └────┬────┘
//!    no-hc / mark-started
//!                  ▼
//!             ┌─────────┐
//!             │started  │ ──idle-expired──► stopping ──► stopped
//!             └────┬────┘                        │
//!                  │                             └── destroy-fail ──► stop_failed
//!             healthcheck-fail-while-running
//!                  ▼
//!             ┌─────────┐
//!             │degraded │ ──retries-exhausted──► stopping ──► stopped
//!             └─────────┘
//! ```
//!
//! Transitions outside this graph are programming errors: `set_status`
//! rejects them and logs at error level. The only extra edge is terminal →
//! `starting`, taken when a failed session is recycled for a retry build.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::types::{SessionUuid, Sha};

use super::application::{Application, CommitDetails};

/// Upper bound on retained per-session log lines; the oldest are dropped.
const MAX_LOG_LINES: usize = 10_000;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Started,
    StartFailed,
    Stopping,
    Stopped,
    StopFailed,
    Degraded,
}

impl SessionStatus {
    /// A session is alive unless it reached a terminal status.
    pub fn is_alive(self) -> bool {
        !matches!(
            self,
            SessionStatus::StartFailed | SessionStatus::Stopped | SessionStatus::StopFailed
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Terminal statuses admit only the recycle edge back to `Starting`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self == next {
            return true;
        }
        match self {
            Starting => matches!(next, Started | StartFailed | Stopping | Degraded),
            Started => matches!(next, Stopping | Degraded),
            Degraded => matches!(next, Started | Stopping),
            Stopping => matches!(next, Stopped | StopFailed),
            StartFailed | Stopped | StopFailed => matches!(next, Starting),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Started => "started",
            SessionStatus::StartFailed => "start_failed",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::StopFailed => "stop_failed",
            SessionStatus::Degraded => "degraded",
        };
        write!(f, "{s}")
    }
}

/// Why a session was (or is being) killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    None,
    Stopped,
    BuildFailed,
    HealthcheckFailed,
    Replaced,
}

impl KillReason {
    /// Reasons that qualify a dead session for a recycled rebuild.
    pub fn is_recyclable(self) -> bool {
        matches!(self, KillReason::BuildFailed | KillReason::HealthcheckFailed)
    }
}

/// Origin of a session log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Stdin,
    Stdout,
    Stderr,
}

/// One line of session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLog {
    pub when: DateTime<Utc>,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub message: String,
}

/// A named duration sample measured around a build phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub duration_ms: u128,
}

/// String variables attached to a session, substituted into command lines,
/// warmup/healthcheck URLs and the target template as `{{key}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(pub HashMap<String, String>);

impl Variables {
    /// Replaces every `{{key}}` occurrence in `input` with its value.
    pub fn apply_to(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (key, value) in &self.0 {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Named cancellable scopes registered on a session, so external actors
/// (destroy during build, shutdown) can cancel in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Build,
    Healthcheck,
}

/// Mutable session state, guarded by one mutex.
#[derive(Debug)]
struct SessionInner {
    status: SessionStatus,
    port: u16,
    target: String,
    folder: PathBuf,
    commit_id: Option<Sha>,
    commit: Option<CommitDetails>,
    /// Seconds remaining before inactivity kill; -1 means pinned forever.
    max_age: i64,
    inactive_at: DateTime<Utc>,
    variables: Variables,
    logs: VecDeque<SessionLog>,
    metrics: Vec<Metric>,
    startup_retries: u32,
    kill_reason: KillReason,
    replaces: Option<Weak<Session>>,
    /// Process groups spawned by this session's commands, signalled on
    /// destroy to reap any surviving child tree.
    process_groups: Vec<i32>,
}

/// One running build+serve instance of an application at a specific commit.
pub struct Session {
    pub uuid: SessionUuid,
    /// First dashed segment of the UUID, used in log lines.
    pub short_uuid: String,
    pub application: Arc<Application>,
    /// Denormalized snapshot of the application name at creation time.
    pub application_name: String,
    /// The user-supplied ref string (branch, tag, or SHA).
    pub checkout: String,
    inner: Mutex<SessionInner>,
    scopes: Mutex<HashMap<ContextKey, CancellationToken>>,
}

impl Session {
    /// Creates a fresh session in `Starting` status.
    pub fn new(application: Arc<Application>, checkout: impl Into<String>) -> Arc<Session> {
        Self::with_uuid(SessionUuid::generate(), application, checkout)
    }

    /// Creates a session with a caller-supplied UUID (rehydration).
    pub fn with_uuid(
        uuid: SessionUuid,
        application: Arc<Application>,
        checkout: impl Into<String>,
    ) -> Arc<Session> {
        let application_name = application.name.clone();
        Arc::new(Session {
            uuid,
            short_uuid: uuid.short(),
            application,
            application_name,
            checkout: checkout.into(),
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Starting,
                port: 0,
                target: String::new(),
                folder: PathBuf::new(),
                commit_id: None,
                commit: None,
                max_age: 0,
                inactive_at: Utc::now(),
                variables: Variables::default(),
                logs: VecDeque::new(),
                metrics: Vec::new(),
                startup_retries: 0,
                kill_reason: KillReason::None,
                replaces: None,
                process_groups: Vec::new(),
            }),
            scopes: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session mutex poisoned")
    }

    // ─── Status ───

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Applies a status transition, enforcing the lifecycle graph.
    ///
    /// Returns false (and logs at error level) when the transition is not a
    /// legal edge; the status is left unchanged in that case.
    pub fn set_status(&self, next: SessionStatus) -> bool {
        let mut inner = self.lock();
        if !inner.status.can_transition_to(next) {
            error!(
                session = %self.short_uuid,
                from = %inner.status,
                to = %next,
                "Illegal session status transition rejected"
            );
            return false;
        }
        inner.status = next;
        true
    }

    /// Resets a recycled session back to `Starting`.
    pub fn reset_for_recycle(&self) {
        let mut inner = self.lock();
        inner.status = SessionStatus::Starting;
        inner.kill_reason = KillReason::None;
        inner.variables = Variables::default();
        inner.startup_retries += 1;
        inner.process_groups.clear();
    }

    /// Records a spawned command's process group for later reaping.
    pub fn track_process_group(&self, pgid: i32) {
        self.lock().process_groups.push(pgid);
    }

    /// Process groups spawned by this session's commands.
    pub fn tracked_process_groups(&self) -> Vec<i32> {
        self.lock().process_groups.clone()
    }

    // ─── Placement ───

    pub fn port(&self) -> u16 {
        self.lock().port
    }

    pub fn set_port(&self, port: u16) {
        self.lock().port = port;
    }

    pub fn target(&self) -> String {
        self.lock().target.clone()
    }

    pub fn set_target(&self, target: impl Into<String>) {
        self.lock().target = target.into();
    }

    pub fn folder(&self) -> PathBuf {
        self.lock().folder.clone()
    }

    pub fn set_folder(&self, folder: impl Into<PathBuf>) {
        self.lock().folder = folder.into();
    }

    // ─── Build identity ───

    pub fn commit_id(&self) -> Option<Sha> {
        self.lock().commit_id.clone()
    }

    pub fn set_commit(&self, commit_id: Sha, commit: Option<CommitDetails>) {
        let mut inner = self.lock();
        inner.commit_id = Some(commit_id);
        inner.commit = commit;
    }

    pub fn commit(&self) -> Option<CommitDetails> {
        self.lock().commit.clone()
    }

    // ─── Aging ───

    pub fn max_age(&self) -> i64 {
        self.lock().max_age
    }

    pub fn set_max_age(&self, max_age: i64) {
        self.lock().max_age = max_age;
    }

    pub fn decrease_max_age(&self) {
        self.lock().max_age -= 1;
    }

    pub fn inactive_at(&self) -> DateTime<Utc> {
        self.lock().inactive_at
    }

    pub fn set_inactive_at(&self, at: DateTime<Utc>) {
        self.lock().inactive_at = at;
    }

    /// Refreshes the inactivity deadline. Called by the request service on
    /// every inbound request routed to this session.
    pub fn mark_as_being_requested(&self) {
        let inactivity_timeout = self.application.configuration().recycle.inactivity_timeout;
        let mut inner = self.lock();
        if inner.max_age == -1 {
            // Watched sessions are pinned and never age.
            return;
        }
        inner.inactive_at = Utc::now() + chrono::Duration::seconds(inactivity_timeout as i64);
        inner.max_age = inactivity_timeout as i64;
    }

    // ─── Variables ───

    pub fn variables(&self) -> Variables {
        self.lock().variables.clone()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().variables.set(key, value);
    }

    /// Applies `{{variable}}` substitution using the current variables.
    pub fn apply_variables(&self, input: &str) -> String {
        self.lock().variables.apply_to(input)
    }

    // ─── Retries and kill reason ───

    pub fn startup_retries(&self) -> u32 {
        self.lock().startup_retries
    }

    pub fn reset_startup_retries(&self) {
        self.lock().startup_retries = 0;
    }

    pub fn kill_reason(&self) -> KillReason {
        self.lock().kill_reason
    }

    pub fn set_kill_reason(&self, reason: KillReason) {
        self.lock().kill_reason = reason;
    }

    // ─── Replacement linkage ───

    pub fn set_replaces(&self, previous: &Arc<Session>) {
        self.lock().replaces = Some(Arc::downgrade(previous));
    }

    pub fn replaces(&self) -> Option<Arc<Session>> {
        self.lock().replaces.as_ref().and_then(Weak::upgrade)
    }

    // ─── Cancellation scopes ───

    /// Registers a named cancellable scope and returns its token.
    ///
    /// An existing scope under the same key is replaced (and left
    /// uncancelled; its owner observes cancellation only through the token
    /// it already holds).
    pub fn register_scope(&self, key: ContextKey) -> CancellationToken {
        let token = CancellationToken::new();
        self.scopes
            .lock()
            .expect("scopes mutex poisoned")
            .insert(key, token.clone());
        token
    }

    /// Removes a named scope without cancelling it (normal completion).
    pub fn release_scope(&self, key: ContextKey) {
        self.scopes
            .lock()
            .expect("scopes mutex poisoned")
            .remove(&key);
    }

    /// Cancels every registered scope. Used by destroy and shutdown.
    pub fn cancel_scopes(&self) {
        let scopes = self.scopes.lock().expect("scopes mutex poisoned");
        for token in scopes.values() {
            token.cancel();
        }
    }

    // ─── Metrics ───

    /// Starts measuring a named phase; the sample is recorded when the
    /// returned timer is dropped.
    pub fn start_metric(self: &Arc<Self>, name: impl Into<String>) -> MetricTimer {
        MetricTimer {
            session: Arc::clone(self),
            name: name.into(),
            started: Instant::now(),
        }
    }

    fn record_metric(&self, name: String, duration: Duration) {
        self.lock().metrics.push(Metric {
            name,
            duration_ms: duration.as_millis(),
        });
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.lock().metrics.clone()
    }

    // ─── Logs ───

    fn push_log(&self, log_type: LogType, message: &str) {
        let mut inner = self.lock();
        if inner.logs.len() >= MAX_LOG_LINES {
            inner.logs.pop_front();
        }
        inner.logs.push_back(SessionLog {
            when: Utc::now(),
            log_type,
            message: message.to_string(),
        });
    }

    pub fn logs(&self) -> Vec<SessionLog> {
        self.lock().logs.iter().cloned().collect()
    }

    pub fn log_trace(&self, message: &str) {
        trace!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Trace, message);
    }

    pub fn log_debug(&self, message: &str) {
        debug!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Debug, message);
    }

    pub fn log_info(&self, message: &str) {
        info!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Info, message);
    }

    pub fn log_warn(&self, message: &str) {
        warn!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Warn, message);
    }

    pub fn log_error(&self, message: &str) {
        error!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Error, message);
    }

    pub fn log_critical(&self, message: &str) {
        error!(session = %self.short_uuid, "{message}");
        self.push_log(LogType::Critical, message);
    }

    pub fn log_stdin(&self, message: &str) {
        info!(session = %self.short_uuid, "(stdin)> {message}");
        self.push_log(LogType::Stdin, message);
    }

    pub fn log_stdout(&self, message: &str) {
        info!(session = %self.short_uuid, "(stdout)> {message}");
        self.push_log(LogType::Stdout, message);
    }

    pub fn log_stderr(&self, message: &str) {
        info!(session = %self.short_uuid, "(stderr)> {message}");
        self.push_log(LogType::Stderr, message);
    }

    // ─── Persistence ───

    /// Snapshot for on-disk persistence.
    pub fn to_record(&self) -> SessionRecord {
        let inner = self.lock();
        SessionRecord {
            uuid: self.uuid,
            application_name: self.application_name.clone(),
            checkout: self.checkout.clone(),
            status: inner.status,
            port: inner.port,
            target: inner.target.clone(),
            folder: inner.folder.clone(),
            commit_id: inner.commit_id.clone(),
            variables: inner.variables.clone(),
        }
    }

    /// Rehydrates a session from a persisted record.
    pub fn from_record(record: SessionRecord, application: Arc<Application>) -> Arc<Session> {
        let session = Session::with_uuid(record.uuid, application, record.checkout);
        {
            let mut inner = session.lock();
            inner.status = record.status;
            inner.port = record.port;
            inner.target = record.target;
            inner.folder = record.folder;
            inner.commit_id = record.commit_id;
            inner.variables = record.variables;
        }
        session
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("application_name", &self.application_name)
            .field("checkout", &self.checkout)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Records a metric sample on drop, so phases are measured even on the
/// abort paths.
pub struct MetricTimer {
    session: Arc<Session>,
    name: String,
    started: Instant,
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        self.session
            .record_metric(std::mem::take(&mut self.name), self.started.elapsed());
    }
}

/// On-disk session record, sufficient to rehydrate an alive session after
/// restart with a best-effort healthcheck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uuid: SessionUuid,
    pub application_name: String,
    pub checkout: String,
    pub status: SessionStatus,
    pub port: u16,
    pub target: String,
    pub folder: PathBuf,
    pub commit_id: Option<Sha>,
    pub variables: Variables,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_application;

    fn test_session() -> Arc<Session> {
        Session::new(test_application("test-app"), "main")
    }

    // ─── Status machine ───

    #[test]
    fn new_session_is_starting_and_alive() {
        let session = test_session();
        assert_eq!(session.status(), SessionStatus::Starting);
        assert!(session.status().is_alive());
    }

    #[test]
    fn legal_happy_path_transitions() {
        let session = test_session();
        assert!(session.set_status(SessionStatus::Started));
        assert!(session.set_status(SessionStatus::Stopping));
        assert!(session.set_status(SessionStatus::Stopped));
        assert!(!session.status().is_alive());
    }

    #[test]
    fn degraded_can_recover_or_stop() {
        let session = test_session();
        session.set_status(SessionStatus::Started);
        assert!(session.set_status(SessionStatus::Degraded));
        assert!(session.status().is_alive());
        assert!(session.set_status(SessionStatus::Started));
        session.set_status(SessionStatus::Degraded);
        assert!(session.set_status(SessionStatus::Stopping));
        assert!(session.set_status(SessionStatus::Stopped));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let session = test_session();
        session.set_status(SessionStatus::Started);
        session.set_status(SessionStatus::Stopping);
        session.set_status(SessionStatus::Stopped);
        // stopped is terminal except for the recycle edge
        assert!(!session.set_status(SessionStatus::Started));
        assert_eq!(session.status(), SessionStatus::Stopped);
    }

    #[test]
    fn terminal_statuses_admit_recycle_edge() {
        for terminal in [
            SessionStatus::StartFailed,
            SessionStatus::Stopped,
            SessionStatus::StopFailed,
        ] {
            assert!(terminal.can_transition_to(SessionStatus::Starting));
            assert!(!terminal.can_transition_to(SessionStatus::Started));
        }
    }

    #[test]
    fn alive_statuses() {
        assert!(SessionStatus::Starting.is_alive());
        assert!(SessionStatus::Started.is_alive());
        assert!(SessionStatus::Stopping.is_alive());
        assert!(SessionStatus::Degraded.is_alive());
        assert!(!SessionStatus::StartFailed.is_alive());
        assert!(!SessionStatus::Stopped.is_alive());
        assert!(!SessionStatus::StopFailed.is_alive());
    }

    // ─── Recycle ───

    #[test]
    fn reset_for_recycle_clears_state_and_counts() {
        let session = test_session();
        session.set_variable("uuid", "x");
        session.set_kill_reason(KillReason::BuildFailed);
        session.set_status(SessionStatus::StartFailed);

        session.reset_for_recycle();

        assert_eq!(session.status(), SessionStatus::Starting);
        assert_eq!(session.kill_reason(), KillReason::None);
        assert_eq!(session.startup_retries(), 1);
        assert!(session.variables().get("uuid").is_none());

        session.reset_for_recycle();
        assert_eq!(session.startup_retries(), 2);
    }

    // ─── Variables ───

    #[test]
    fn variables_apply_to_replaces_all_occurrences() {
        let mut variables = Variables::default();
        variables.set("port", "8080");
        variables.set("name", "app");
        assert_eq!(
            variables.apply_to("http://{{name}}:{{port}}/x?p={{port}}"),
            "http://app:8080/x?p=8080"
        );
    }

    #[test]
    fn variables_apply_to_leaves_unknown_placeholders() {
        let variables = Variables::default();
        assert_eq!(variables.apply_to("{{missing}}"), "{{missing}}");
    }

    // ─── Aging ───

    #[test]
    fn mark_as_being_requested_refreshes_deadline() {
        let session = test_session();
        session.set_max_age(1);
        session.set_inactive_at(Utc::now() - chrono::Duration::seconds(10));

        session.mark_as_being_requested();

        assert!(session.inactive_at() > Utc::now());
        assert!(session.max_age() > 1);
    }

    #[test]
    fn mark_as_being_requested_keeps_pinned_sessions_pinned() {
        let session = test_session();
        session.set_max_age(-1);
        session.mark_as_being_requested();
        assert_eq!(session.max_age(), -1);
    }

    // ─── Scopes ───

    #[test]
    fn cancel_scopes_cancels_registered_tokens() {
        let session = test_session();
        let build = session.register_scope(ContextKey::Build);
        let healthcheck = session.register_scope(ContextKey::Healthcheck);

        session.cancel_scopes();

        assert!(build.is_cancelled());
        assert!(healthcheck.is_cancelled());
    }

    #[test]
    fn released_scope_is_not_cancelled() {
        let session = test_session();
        let build = session.register_scope(ContextKey::Build);
        session.release_scope(ContextKey::Build);

        session.cancel_scopes();

        assert!(!build.is_cancelled());
    }

    // ─── Logs and metrics ───

    #[test]
    fn logs_are_bounded() {
        let session = test_session();
        for i in 0..(MAX_LOG_LINES + 10) {
            session.log_trace(&format!("line {i}"));
        }
        let logs = session.logs();
        assert_eq!(logs.len(), MAX_LOG_LINES);
        assert_eq!(logs[0].message, "line 10");
    }

    #[test]
    fn metric_timer_records_on_drop() {
        let session = test_session();
        {
            let _timer = session.start_metric("Build (total)");
        }
        let metrics = session.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "Build (total)");
    }

    // ─── Persistence round-trip ───

    #[test]
    fn record_roundtrip_preserves_identity_and_placement() {
        let session = test_session();
        session.set_port(1234);
        session.set_target("http://127.0.0.1:1234");
        session.set_variable("commit", "abc");

        let record = session.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        let restored = Session::from_record(parsed, Arc::clone(&session.application));

        assert_eq!(restored.uuid, session.uuid);
        assert_eq!(restored.port(), 1234);
        assert_eq!(restored.target(), "http://127.0.0.1:1234");
        assert_eq!(restored.variables().get("commit"), Some("abc"));
    }
}
