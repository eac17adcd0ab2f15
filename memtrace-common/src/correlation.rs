//! Entry/return correlation for allocator primitives
//!
//! A uprobe sees the arguments, the matching uretprobe sees the result. The
//! two are bridged by a per-call-site table keyed by `pid_tgid`: a thread is
//! inside at most one call of a given primitive at a time, so the key is
//! unique for the duration of the call. A nested re-entry overwrites the
//! stashed value and the first return consumes it.

use crate::ancestry::{is_tracked, AncestryMaps};
use crate::event::AllocKind;
use crate::pid_of;

/// Per-call-site pending table
pub trait PendingCalls<V: Copy> {
    /// Store `args` for the thread, replacing any previous value.
    /// Returns `false` when the table is full.
    fn stash(&self, pid_tgid: u64, args: &V) -> bool;

    /// Read and delete the thread's entry
    fn take(&self, pid_tgid: u64) -> Option<V>;
}

/// How the reported size is derived from the first two arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// `malloc(size)`
    FirstArg,
    /// `aligned_alloc(align, size)`, `memalign(align, size)`
    SecondArg,
    /// `calloc(nmemb, size)`, unchecked
    Product,
}

impl SizeRule {
    #[inline(always)]
    #[must_use]
    pub const fn size(self, arg0: u64, arg1: u64) -> u64 {
        match self {
            Self::FirstArg => arg0,
            Self::SecondArg => arg1,
            Self::Product => arg0.wrapping_mul(arg1),
        }
    }
}

/// Event shape a sized primitive is reported as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizedEvent {
    Malloc,
    Calloc,
    AlignedAlloc,
}

/// An allocator entry point that takes a size and returns a pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedPrimitive {
    /// Exported libc symbol
    pub symbol: &'static str,
    pub rule: SizeRule,
    pub event: SizedEvent,
}

impl SizedPrimitive {
    pub const MALLOC: Self =
        Self { symbol: "malloc", rule: SizeRule::FirstArg, event: SizedEvent::Malloc };
    pub const CALLOC: Self =
        Self { symbol: "calloc", rule: SizeRule::Product, event: SizedEvent::Calloc };
    pub const ALIGNED_ALLOC: Self = Self {
        symbol: "aligned_alloc",
        rule: SizeRule::SecondArg,
        event: SizedEvent::AlignedAlloc,
    };
    // no discriminant of its own on the wire
    pub const MEMALIGN: Self =
        Self { symbol: "memalign", rule: SizeRule::SecondArg, event: SizedEvent::AlignedAlloc };

    #[inline(always)]
    #[must_use]
    pub const fn report(&self, addr: u64, size: u64) -> AllocKind {
        match self.event {
            SizedEvent::Malloc => AllocKind::Malloc { addr, size },
            SizedEvent::Calloc => AllocKind::Calloc { addr, size },
            SizedEvent::AlignedAlloc => AllocKind::AlignedAlloc { addr, size },
        }
    }
}

pub const SIZED_PRIMITIVES: [SizedPrimitive; 4] = [
    SizedPrimitive::MALLOC,
    SizedPrimitive::CALLOC,
    SizedPrimitive::ALIGNED_ALLOC,
    SizedPrimitive::MEMALIGN,
];

/// Stashed `realloc(ptr, size)` arguments
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReallocArgs {
    pub old_addr: u64,
    pub size: u64,
}

/// Stashed `mmap(addr, len, ...)` arguments
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapArgs {
    pub addr: u64,
    pub len: u64,
}

/// Stash `args` for the current thread if its process is tracked
///
/// Returns whether an entry was stored.
#[inline(always)]
pub fn record_entry<M, P, V>(ancestry: &M, pending: &P, pid_tgid: u64, args: &V) -> bool
where
    M: AncestryMaps + ?Sized,
    P: PendingCalls<V> + ?Sized,
    V: Copy,
{
    if !is_tracked(ancestry, pid_of(pid_tgid)) {
        return false;
    }
    pending.stash(pid_tgid, args)
}
