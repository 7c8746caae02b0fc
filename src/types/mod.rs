//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds
//! (e.g. using a checkout ref where a resolved commit SHA is expected) and
//! make the code more self-documenting.

pub mod ids;

pub use ids::{NotACommitSha, SessionUuid, Sha};
