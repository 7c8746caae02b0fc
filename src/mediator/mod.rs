//! The mediator: typed request/response queues coupling producers to the
//! background workers.
//!
//! Two queue shapes exist:
//! - RPC-style ([`RequestQueue`]): the caller blocks until the worker picks
//!   the request up *and* replies. Used by session build, filesystem
//!   provisioning, application init and application fetch.
//! - Fire-and-forget ([`SignalQueue`]): the caller blocks only until the
//!   worker accepts delivery. Used by start, healthcheck, clean and
//!   destroy.
//!
//! Every queue is multi-enqueuer, single-consumer. Channels are bounded at
//! capacity one so an enqueue exerts backpressure against the worker rather
//! than growing memory. Workers never call each other directly; all
//! cross-worker traffic goes through these queues, so reentry cannot form
//! a lock cycle.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::models::{Application, Session, SessionStatus};
use crate::versioning::GitError;

/// Channel capacity: rendezvous-like delivery.
const QUEUE_CAPACITY: usize = 1;

/// The consumer side of a queue has terminated. Only observable during
/// shutdown; treated as cooperative cancellation by producers.
#[derive(Debug, Clone, Copy, Error)]
#[error("worker queue closed")]
pub struct QueueClosed;

/// RPC-style queue: each request carries a oneshot reply channel.
pub struct RequestQueue<Req, Resp> {
    tx: mpsc::Sender<(Req, oneshot::Sender<Resp>)>,
}

impl<Req, Resp> Clone for RequestQueue<Req, Resp> {
    fn clone(&self) -> Self {
        RequestQueue {
            tx: self.tx.clone(),
        }
    }
}

/// Receiver half handed to the owning worker.
pub type RequestReceiver<Req, Resp> = mpsc::Receiver<(Req, oneshot::Sender<Resp>)>;

impl<Req, Resp> RequestQueue<Req, Resp> {
    pub fn new() -> (Self, RequestReceiver<Req, Resp>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (RequestQueue { tx }, rx)
    }

    /// Sends a request and awaits the worker's reply.
    pub async fn enqueue(&self, request: Req) -> Result<Resp, QueueClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| QueueClosed)?;
        reply_rx.await.map_err(|_| QueueClosed)
    }
}

/// Fire-and-forget queue.
pub struct SignalQueue<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for SignalQueue<T> {
    fn clone(&self) -> Self {
        SignalQueue {
            tx: self.tx.clone(),
        }
    }
}

/// Receiver half handed to the owning worker.
pub type SignalReceiver<T> = mpsc::Receiver<T>;

impl<T> SignalQueue<T> {
    pub fn new() -> (Self, SignalReceiver<T>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (SignalQueue { tx }, rx)
    }

    /// Delivers a payload, blocking until the worker accepts it.
    pub async fn enqueue(&self, payload: T) -> Result<(), QueueClosed> {
        self.tx.send(payload).await.map_err(|_| QueueClosed)
    }
}

// ─── Payloads ───

/// Input to the session build worker.
pub struct SessionBuildInput {
    pub application: Arc<Application>,
    pub checkout: String,
    /// Present on recycled rebuilds and replacements.
    pub previous_session: Option<Arc<Session>>,
}

/// Structured failure cause surfaced to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailingReason {
    GlobalConcurrencyExceeded,
    ApplicationConcurrencyExceeded,
    CheckoutUnknown,
    PortUnavailable,
    FilesystemFailed,
    CommandFailed,
}

/// Outcome of a session build request.
#[derive(Debug, Clone)]
pub enum SessionBuildResult {
    /// The build was accepted; the session may still be `starting`.
    Succeeded { session: Arc<Session> },

    /// The build was rejected or failed before the session was visible.
    Failed {
        reason: FailingReason,
        message: String,
    },
}

impl SessionBuildResult {
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            SessionBuildResult::Succeeded { session } => Some(session),
            SessionBuildResult::Failed { .. } => None,
        }
    }

    pub fn failed(reason: FailingReason, message: impl Into<String>) -> Self {
        SessionBuildResult::Failed {
            reason,
            message: message.into(),
        }
    }
}

/// Input to the application fetch worker.
pub struct ApplicationFetchInput {
    pub application: Arc<Application>,
    /// When true, watched refs whose tip moved trigger rebuilds.
    pub watch_objects: bool,
}

/// Input to the clean worker: finalize a session with a terminal status.
pub struct CleanSessionInput {
    pub session: Arc<Session>,
    pub status: SessionStatus,
}

/// Continuation invoked by the destroy worker after termination completes.
pub type PostDestroyCallback = Box<dyn FnOnce(Arc<Session>) + Send>;

/// Input to the destroy worker.
pub struct DestroySessionInput {
    pub session: Arc<Session>,
    /// Used by watch-triggered rebuilds to chain a fresh build after the
    /// old session's placement is released.
    pub on_destroyed: Option<PostDestroyCallback>,
}

impl DestroySessionInput {
    pub fn new(session: Arc<Session>) -> Self {
        DestroySessionInput {
            session,
            on_destroyed: None,
        }
    }

    pub fn with_callback(session: Arc<Session>, callback: PostDestroyCallback) -> Self {
        DestroySessionInput {
            session,
            on_destroyed: Some(callback),
        }
    }
}

/// The queue bundle shared by every producer.
#[derive(Clone)]
pub struct Mediator {
    pub build_session: RequestQueue<SessionBuildInput, SessionBuildResult>,
    pub session_filesystem: RequestQueue<Arc<Session>, Result<PathBuf, GitError>>,
    pub application_init: RequestQueue<Arc<Application>, Result<(), GitError>>,
    pub application_fetch: RequestQueue<ApplicationFetchInput, ()>,
    pub start_session: SignalQueue<Arc<Session>>,
    pub healthcheck_session: SignalQueue<Arc<Session>>,
    pub clean_session: SignalQueue<CleanSessionInput>,
    pub destroy_session: SignalQueue<DestroySessionInput>,
}

/// Receiver halves, consumed one each by the workers.
pub struct MediatorReceivers {
    pub build_session: RequestReceiver<SessionBuildInput, SessionBuildResult>,
    pub session_filesystem: RequestReceiver<Arc<Session>, Result<PathBuf, GitError>>,
    pub application_init: RequestReceiver<Arc<Application>, Result<(), GitError>>,
    pub application_fetch: RequestReceiver<ApplicationFetchInput, ()>,
    pub start_session: SignalReceiver<Arc<Session>>,
    pub healthcheck_session: SignalReceiver<Arc<Session>>,
    pub clean_session: SignalReceiver<CleanSessionInput>,
    pub destroy_session: SignalReceiver<DestroySessionInput>,
}

impl Mediator {
    /// Creates the queue bundle and its receiver halves.
    pub fn new() -> (Mediator, MediatorReceivers) {
        let (build_session, build_session_rx) = RequestQueue::new();
        let (session_filesystem, session_filesystem_rx) = RequestQueue::new();
        let (application_init, application_init_rx) = RequestQueue::new();
        let (application_fetch, application_fetch_rx) = RequestQueue::new();
        let (start_session, start_session_rx) = SignalQueue::new();
        let (healthcheck_session, healthcheck_session_rx) = SignalQueue::new();
        let (clean_session, clean_session_rx) = SignalQueue::new();
        let (destroy_session, destroy_session_rx) = SignalQueue::new();

        (
            Mediator {
                build_session,
                session_filesystem,
                application_init,
                application_fetch,
                start_session,
                healthcheck_session,
                clean_session,
                destroy_session,
            },
            MediatorReceivers {
                build_session: build_session_rx,
                session_filesystem: session_filesystem_rx,
                application_init: application_init_rx,
                application_fetch: application_fetch_rx,
                start_session: start_session_rx,
                healthcheck_session: healthcheck_session_rx,
                clean_session: clean_session_rx,
                destroy_session: destroy_session_rx,
            },
        )
    }
}
