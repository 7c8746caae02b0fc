//! Services consumed by the HTTP layer.

pub mod request;

pub use request::{RequestService, SessionRoute};
