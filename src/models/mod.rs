//! Domain models: applications and their sessions.

pub mod application;
pub mod session;

pub use application::{
    Application, ApplicationEventType, ApplicationGitState, Branch, CommitDetails, RemoteObject,
};
pub use session::{
    ContextKey, KillReason, LogType, Session, SessionLog, SessionRecord, SessionStatus, Variables,
};
