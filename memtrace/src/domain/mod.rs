//! Domain model for memtrace
//!
//! - Compile-time safety via newtype pattern
//! - Structured error handling

pub mod errors;
pub mod types;

pub use types::{Pid, Tid};

pub use errors::{ExportError, TracerError};
