//! In-memory registries for applications and sessions.
//!
//! Both stores are the only shared mutable surfaces reachable from workers
//! and HTTP handlers; everything else communicates over the mediator.

pub mod application;
pub mod persistence;
pub mod session;

pub use application::ApplicationStore;
pub use persistence::{JsonFilePersistence, NoopPersistence, SessionPersistence};
pub use session::SessionStore;
