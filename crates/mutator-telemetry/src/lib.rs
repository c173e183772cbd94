//! This crate contains the tracing primitives used by the mutating webhook to
//! emit console and rolling file logs.
pub mod tracing;

pub use tracing::Tracing;
