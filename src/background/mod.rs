//! Background workers driving the session and application state machines.
//!
//! Each worker owns one consumer task reading its mediator queue in FIFO
//! order. Workers never call each other directly: all cross-worker traffic
//! goes back through the mediator, so reentry cannot form a lock cycle.
//!
//! The fabric:
//! - build: admission, dedup, port allocation, spawned per-session builds
//! - start: mark started, watch pinning, inactivity timer
//! - healthcheck: HTTP polling, degraded handling, retry exhaustion
//! - filesystem: per-application serialized working-tree provisioning
//! - destroy: stop commands, process-tree termination, continuations
//! - clean: port release, folder removal, terminal status, store slot
//! - application init: canonical clone plus the first fetch
//! - application fetch: ref enumeration, map swap, watch diffing

pub mod application_fetch;
pub mod application_init;
pub mod command;
pub mod ports;
pub mod session_build;
pub mod session_clean;
pub mod session_destroy;
pub mod session_filesystem;
pub mod session_healthcheck;
pub mod session_start;

pub use application_fetch::ApplicationFetchWorker;
pub use application_init::ApplicationInitWorker;
pub use ports::PortAllocator;
pub use session_build::SessionBuildWorker;
pub use session_clean::SessionCleanWorker;
pub use session_destroy::SessionDestroyWorker;
pub use session_filesystem::SessionFileSystemWorker;
pub use session_healthcheck::SessionHealthcheckWorker;
pub use session_start::SessionStartWorker;
