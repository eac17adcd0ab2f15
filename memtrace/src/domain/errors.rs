//! Structured error types for memtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("eBPF object not found: {}", .0.display())]
    ObjectNotFound(PathBuf),

    #[error("Failed to load eBPF object {object}: {error}")]
    LoadFailed { object: String, error: String },

    #[error("Failed to attach {probe} to {target}: {error}")]
    ProbeAttachFailed { probe: String, target: String, error: String },

    #[error("Map {map} unavailable: {error}")]
    MapAccess { map: &'static str, error: String },

    #[error("No libc with an exported malloc found (searched {searched} paths)")]
    LibcNotFound { searched: usize },

    #[error("Malformed {channel} record: {len} bytes, expected {expected}")]
    MalformedRecord { channel: &'static str, len: usize, expected: usize },

    #[error("Unknown {channel} event type {event_type}")]
    UnknownEventType { channel: &'static str, event_type: u8 },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write artifact: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_attach_error() {
        let err = TracerError::ProbeAttachFailed {
            probe: "malloc_enter".to_string(),
            target: "/usr/lib/x86_64-linux-gnu/libc.so.6".to_string(),
            error: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("malloc_enter"));
        assert!(err.to_string().contains("libc.so.6"));
    }

    #[test]
    fn test_malformed_record_display() {
        let err = TracerError::MalformedRecord { channel: "alloc", len: 12, expected: 48 };
        assert_eq!(err.to_string(), "Malformed alloc record: 12 bytes, expected 48");
    }
}
