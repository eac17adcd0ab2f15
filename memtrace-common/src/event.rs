//! Event wire format
//!
//! Two record shapes travel through two separate ring buffers:
//!
//! - [`ProcessRecord`] - lifecycle facts from `exectrack` (fork, exec, exit)
//! - [`AllocRecord`] - allocator and mapping facts from `memtrack`
//!
//! Both are `#[repr(C)]` and byte-compatible with the C layout userspace
//! tooling already understands (48 bytes each on 64-bit targets). The
//! discriminant namespaces overlap numerically (FORK=1 and MALLOC=1) and are
//! never mixed on the same channel.
//!
//! The allocation payload is three raw words on the wire. Producers build it
//! from [`AllocKind`] and consumers decode it back into [`AllocKind`], so the
//! word layout never leaks past this module.

/// Command name length including the NUL terminator
pub const COMM_LEN: usize = 16;

/// Lifecycle discriminants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventType {
    Fork = 1,
    Exec = 2,
    Exit = 3,
}

impl ProcessEventType {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Fork),
            2 => Some(Self::Exec),
            3 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Allocation namespace discriminants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEventType {
    Malloc = 1,
    Free = 2,
    Calloc = 3,
    Realloc = 4,
    AlignedAlloc = 5,
    Mmap = 6,
    Munmap = 7,
    Brk = 8,
    Execve = 9,
}

impl AllocEventType {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Malloc),
            2 => Some(Self::Free),
            3 => Some(Self::Calloc),
            4 => Some(Self::Realloc),
            5 => Some(Self::AlignedAlloc),
            6 => Some(Self::Mmap),
            7 => Some(Self::Munmap),
            8 => Some(Self::Brk),
            9 => Some(Self::Execve),
            _ => None,
        }
    }
}

/// Lifecycle event sent from `exectrack` to userspace
///
/// `ppid` is only meaningful for [`ProcessEventType::Fork`], where `pid` is
/// the child and `ppid` the forking task. `comm` is the current task's
/// command name at hook time, NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub event_type: u8,
    /// Boot-relative monotonic time (`bpf_ktime_get_ns`)
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub comm: [u8; COMM_LEN],
}

impl ProcessRecord {
    #[must_use]
    pub const fn new(
        kind: ProcessEventType,
        timestamp_ns: u64,
        pid: u32,
        tid: u32,
        ppid: u32,
        comm: [u8; COMM_LEN],
    ) -> Self {
        Self { event_type: kind as u8, timestamp_ns, pid, tid, ppid, comm }
    }

    #[must_use]
    pub const fn kind(&self) -> Option<ProcessEventType> {
        ProcessEventType::from_u8(self.event_type)
    }

    /// Command name up to the first NUL
    #[must_use]
    pub fn comm_str(&self) -> &str {
        let len = self.comm.iter().position(|&c| c == 0).unwrap_or(COMM_LEN);
        core::str::from_utf8(&self.comm[..len]).unwrap_or("<invalid>")
    }

    /// Copy a record out of a ring buffer item
    ///
    /// Returns `None` when the slice is shorter than a record.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_record(bytes)
    }
}

/// Header shared by every allocation record
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub event_type: u8,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
}

/// Allocation/mapping event sent from `memtrack` to userspace
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub header: EventHeader,
    /// Interpreted per `header.event_type`, see [`AllocKind`]
    pub payload: [u64; 3],
}

impl AllocRecord {
    #[must_use]
    pub const fn new(kind: AllocKind, timestamp_ns: u64, pid: u32, tid: u32) -> Self {
        Self {
            header: EventHeader { event_type: kind.event_type() as u8, timestamp_ns, pid, tid },
            payload: kind.encode(),
        }
    }

    /// Decode the payload according to the discriminant
    ///
    /// Returns `None` for an unknown discriminant.
    #[must_use]
    pub const fn kind(&self) -> Option<AllocKind> {
        match AllocEventType::from_u8(self.header.event_type) {
            Some(event_type) => Some(AllocKind::decode(event_type, &self.payload)),
            None => None,
        }
    }

    /// Copy a record out of a ring buffer item
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_record(bytes)
    }
}

/// Decoded allocation payload
///
/// Field sets follow the wire shapes: `alloc{addr,size}` for
/// malloc/calloc/aligned_alloc, `free{addr}`, `realloc{old_addr,new_addr,size}`
/// and `mmap{addr,size}` reused by mmap/munmap/brk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
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

impl AllocKind {
    #[must_use]
    pub const fn event_type(&self) -> AllocEventType {
        match self {
            Self::Malloc { .. } => AllocEventType::Malloc,
            Self::Free { .. } => AllocEventType::Free,
            Self::Calloc { .. } => AllocEventType::Calloc,
            Self::Realloc { .. } => AllocEventType::Realloc,
            Self::AlignedAlloc { .. } => AllocEventType::AlignedAlloc,
            Self::Mmap { .. } => AllocEventType::Mmap,
            Self::Munmap { .. } => AllocEventType::Munmap,
            Self::Brk { .. } => AllocEventType::Brk,
            Self::Execve => AllocEventType::Execve,
        }
    }

    /// Address the event is about (new address for realloc)
    #[must_use]
    pub const fn addr(&self) -> Option<u64> {
        match *self {
            Self::Malloc { addr, .. }
            | Self::Free { addr }
            | Self::Calloc { addr, .. }
            | Self::AlignedAlloc { addr, .. }
            | Self::Mmap { addr, .. }
            | Self::Munmap { addr, .. }
            | Self::Brk { addr, .. } => Some(addr),
            Self::Realloc { new_addr, .. } => Some(new_addr),
            Self::Execve => None,
        }
    }

    const fn encode(self) -> [u64; 3] {
        match self {
            Self::Malloc { addr, size }
            | Self::Calloc { addr, size }
            | Self::AlignedAlloc { addr, size }
            | Self::Mmap { addr, size }
            | Self::Munmap { addr, size }
            | Self::Brk { addr, size } => [addr, size, 0],
            Self::Free { addr } => [addr, 0, 0],
            Self::Realloc { old_addr, new_addr, size } => [old_addr, new_addr, size],
            Self::Execve => [0; 3],
        }
    }

    const fn decode(event_type: AllocEventType, payload: &[u64; 3]) -> Self {
        let [a, b, c] = *payload;
        match event_type {
            AllocEventType::Malloc => Self::Malloc { addr: a, size: b },
            AllocEventType::Free => Self::Free { addr: a },
            AllocEventType::Calloc => Self::Calloc { addr: a, size: b },
            AllocEventType::Realloc => Self::Realloc { old_addr: a, new_addr: b, size: c },
            AllocEventType::AlignedAlloc => Self::AlignedAlloc { addr: a, size: b },
            AllocEventType::Mmap => Self::Mmap { addr: a, size: b },
            AllocEventType::Munmap => Self::Munmap { addr: a, size: b },
            AllocEventType::Brk => Self::Brk { addr: a, size: b },
            AllocEventType::Execve => Self::Execve,
        }
    }
}

fn read_record<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < core::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; both record types are plain `repr(C)` integers
    #[allow(unsafe_code)]
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

// Layout checks against the C definitions (`struct event` in both programs)
const _: () = {
    use core::mem::{offset_of, size_of};

    assert!(size_of::<ProcessRecord>() == 48);
    assert!(offset_of!(ProcessRecord, timestamp_ns) == 8);
    assert!(offset_of!(ProcessRecord, pid) == 16);
    assert!(offset_of!(ProcessRecord, tid) == 20);
    assert!(offset_of!(ProcessRecord, ppid) == 24);
    assert!(offset_of!(ProcessRecord, comm) == 28);

    assert!(size_of::<EventHeader>() == 24);
    assert!(size_of::<AllocRecord>() == 48);
    assert!(offset_of!(AllocRecord, payload) == 24);
};
