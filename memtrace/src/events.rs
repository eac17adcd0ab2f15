//! Decoding of ring buffer records into owned trace events
//!
//! Both channels decode into one [`TraceEvent`] type so the artifact can hold
//! a single timeline. The `kind` tag keeps the two discriminant namespaces
//! apart once they are merged.

use memtrace_common::{AllocKind, AllocRecord, ProcessEventType, ProcessRecord};
use serde::{Deserialize, Serialize};

use crate::domain::{Pid, Tid, TracerError};

/// One observed fact, in userspace form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp_ns: u64,
    pub pid: Pid,
    pub tid: Tid,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Fork { ppid: Pid, comm: String },
    Exec { comm: String },
    Exit { comm: String },
    Malloc { addr: u64, size: u64 },
    Free { addr: u64 },
    Calloc { addr: u64, size: u64 },
    Realloc { old_addr: u64, new_addr: u64, size: u64 },
    AlignedAlloc { addr: u64, size: u64 },
    Mmap { addr: u64, size: u64 },
    Munmap { addr: u64, size: u64 },
    Brk { addr: u64, size: u64 },
    Execve,
}

impl EventKind {
    /// Whether the event came from the lifecycle channel
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Fork { .. } | Self::Exec { .. } | Self::Exit { .. })
    }
}

impl From<AllocKind> for EventKind {
    fn from(kind: AllocKind) -> Self {
        match kind {
            AllocKind::Malloc { addr, size } => Self::Malloc { addr, size },
            AllocKind::Free { addr } => Self::Free { addr },
            AllocKind::Calloc { addr, size } => Self::Calloc { addr, size },
            AllocKind::Realloc { old_addr, new_addr, size } => {
                Self::Realloc { old_addr, new_addr, size }
            }
            AllocKind::AlignedAlloc { addr, size } => Self::AlignedAlloc { addr, size },
            AllocKind::Mmap { addr, size } => Self::Mmap { addr, size },
            AllocKind::Munmap { addr, size } => Self::Munmap { addr, size },
            AllocKind::Brk { addr, size } => Self::Brk { addr, size },
            AllocKind::Execve => Self::Execve,
        }
    }
}

impl TryFrom<&ProcessRecord> for TraceEvent {
    type Error = TracerError;

    fn try_from(record: &ProcessRecord) -> Result<Self, Self::Error> {
        let comm = record.comm_str().to_owned();
        let kind = match record.kind() {
            Some(ProcessEventType::Fork) => EventKind::Fork { ppid: Pid(record.ppid), comm },
            Some(ProcessEventType::Exec) => EventKind::Exec { comm },
            Some(ProcessEventType::Exit) => EventKind::Exit { comm },
            None => {
                return Err(TracerError::UnknownEventType {
                    channel: "process",
                    event_type: record.event_type,
                })
            }
        };
        Ok(Self { timestamp_ns: record.timestamp_ns, pid: Pid(record.pid), tid: Tid(record.tid), kind })
    }
}

impl TryFrom<&AllocRecord> for TraceEvent {
    type Error = TracerError;

    fn try_from(record: &AllocRecord) -> Result<Self, Self::Error> {
        let header = &record.header;
        let kind = record.kind().ok_or(TracerError::UnknownEventType {
            channel: "alloc",
            event_type: header.event_type,
        })?;
        Ok(Self {
            timestamp_ns: header.timestamp_ns,
            pid: Pid(header.pid),
            tid: Tid(header.tid),
            kind: kind.into(),
        })
    }
}

/// Decode one item from the `exectrack` ring buffer
///
/// # Errors
/// Returns an error for a short buffer or an unknown event type
pub fn decode_process(bytes: &[u8]) -> Result<TraceEvent, TracerError> {
    let record = ProcessRecord::from_bytes(bytes).ok_or(TracerError::MalformedRecord {
        channel: "process",
        len: bytes.len(),
        expected: std::mem::size_of::<ProcessRecord>(),
    })?;
    TraceEvent::try_from(&record)
}

/// Decode one item from the `memtrack` ring buffer
///
/// # Errors
/// Returns an error for a short buffer or an unknown event type
pub fn decode_alloc(bytes: &[u8]) -> Result<TraceEvent, TracerError> {
    let record = AllocRecord::from_bytes(bytes).ok_or(TracerError::MalformedRecord {
        channel: "alloc",
        len: bytes.len(),
        expected: std::mem::size_of::<AllocRecord>(),
    })?;
    TraceEvent::try_from(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace_common::COMM_LEN;

    fn bytes_of<T>(value: &T) -> Vec<u8> {
        // SAFETY: test records are plain repr(C) data
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
                .to_vec()
        }
    }

    #[test]
    fn test_decode_fork() {
        let mut comm = [0u8; COMM_LEN];
        comm[..4].copy_from_slice(b"bash");
        let record = ProcessRecord::new(ProcessEventType::Fork, 100, 2001, 2000, 2000, comm);

        let event = decode_process(&bytes_of(&record)).unwrap();
        assert_eq!(event.pid, Pid(2001));
        assert_eq!(event.tid, Tid(2000));
        assert_eq!(event.kind, EventKind::Fork { ppid: Pid(2000), comm: "bash".into() });
        assert!(event.kind.is_lifecycle());
    }

    #[test]
    fn test_decode_alloc() {
        let record = AllocRecord::new(AllocKind::Calloc { addr: 0xabc, size: 80 }, 5, 10, 11);
        let event = decode_alloc(&bytes_of(&record)).unwrap();
        assert_eq!(event.kind, EventKind::Calloc { addr: 0xabc, size: 80 });
        assert!(!event.kind.is_lifecycle());
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        let record = AllocRecord::new(AllocKind::Execve, 5, 10, 11);
        let mut bytes = bytes_of(&record);

        let err = decode_alloc(&bytes[..20]).unwrap_err();
        assert!(matches!(err, TracerError::MalformedRecord { len: 20, .. }));

        bytes[0] = 200;
        let err = decode_alloc(&bytes).unwrap_err();
        assert!(matches!(err, TracerError::UnknownEventType { event_type: 200, .. }));
    }

    #[test]
    fn test_json_shape() {
        let event = TraceEvent {
            timestamp_ns: 7,
            pid: Pid(1),
            tid: Tid(2),
            kind: EventKind::Realloc { old_addr: 16, new_addr: 32, size: 64 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "realloc");
        assert_eq!(value["pid"], 1);
        assert_eq!(value["new_addr"], 32);

        let back: TraceEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);

        let marker = serde_json::to_value(TraceEvent { kind: EventKind::Execve, ..event }).unwrap();
        assert_eq!(marker["kind"], "execve");
    }
}
