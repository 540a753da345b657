//! This crate contains the tracing and logging primitives used by the Capsule addon controller.
pub mod tracing;

pub use tracing::Tracing;
