//! # Shared Tracing Engine (eBPF ↔ Userspace)
//!
//! Everything the two kernel objects (`exectrack`, `memtrack`) and userspace
//! agree on lives here:
//!
//! - [`event`] - fixed-layout wire records pushed through the ring buffers
//! - [`ancestry`] - the bounded "is this pid part of a tracked tree?" walk
//! - [`correlation`] - entry/return pairing for allocator primitives
//! - [`program`] - the hook bodies, generic over the map/channel traits
//! - [`tracepoint`] - raw tracepoint argument layouts
//! - `kernel` (feature `ebpf`) - trait impls over aya-ebpf maps and helpers
//!
//! The hook bodies are written once against small traits. The eBPF objects
//! plug in kernel maps; the userspace reference engine plugs in bounded
//! in-process tables, so both run the exact same decisions.

#![cfg_attr(not(test), no_std)]

pub mod ancestry;
pub mod correlation;
pub mod event;
pub mod program;
pub mod tracepoint;

#[cfg(feature = "ebpf")]
pub mod kernel;

pub use ancestry::{arm, handle_exit, handle_fork, is_tracked, AncestryMaps, ANCESTRY_DEPTH};
pub use correlation::{MmapArgs, PendingCalls, ReallocArgs, SizeRule, SizedEvent, SizedPrimitive};
pub use event::{
    AllocEventType, AllocKind, AllocRecord, EventHeader, ProcessEventType, ProcessRecord, COMM_LEN,
};
pub use program::{AllocProgram, EnableFlag, EventSink, ExecProgram, TaskContext};

/// Maximum live entries in every hash map (tracked pids, parents, pending calls)
pub const MAX_ENTRIES: u32 = 10_000;

/// Byte size of each ring buffer (256 KiB, must be a power of two multiple of the page size)
pub const RING_BUF_BYTES: u32 = 256 * 1024;

/// Key of the single slot in the `TRACKING_ENABLED` map
pub const TRACKING_ENABLED_KEY: u32 = 0;

/// Process id (tgid) half of a `bpf_get_current_pid_tgid()` value
#[inline(always)]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pid_of(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

/// Thread id half of a `bpf_get_current_pid_tgid()` value
#[inline(always)]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn tid_of(pid_tgid: u64) -> u32 {
    pid_tgid as u32
}

/// Inverse of [`pid_of`]/[`tid_of`]
#[inline(always)]
#[must_use]
pub const fn pid_tgid(pid: u32, tid: u32) -> u64 {
    ((pid as u64) << 32) | tid as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_tgid_split() {
        let key = pid_tgid(1234, 5678);
        assert_eq!(pid_of(key), 1234);
        assert_eq!(tid_of(key), 5678);
        assert_eq!(key >> 32, 1234);
    }
}
