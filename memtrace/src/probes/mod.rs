//! # eBPF object management
//!
//! Loads the two kernel objects, attaches their programs and exposes the
//! control plane (arming pids, toggling allocation reporting) plus the ring
//! buffers userspace drains.
//!
//! ## Objects
//!
//! - `exectrack` - lifecycle tracepoints, see [`ExecTracker`]
//! - `memtrack` - allocator uprobes and memory syscalls, see [`MemTracker`]
//!
//! The objects do not share maps, so arming a pid writes it into both.

pub mod drain;
pub mod loader;

pub use drain::{drain_ring, RingDrain};
pub use loader::{init_ebpf_logger, ExecTracker, MemTracker};

use anyhow::Result;

use crate::domain::Pid;

/// File name of the lifecycle object inside the BPF build directory
pub const EXECTRACK_OBJECT: &str = "exectrack";

/// File name of the allocation object inside the BPF build directory
pub const MEMTRACK_OBJECT: &str = "memtrack";

/// Default BPF build directory, relative to the workspace root
pub const DEFAULT_BPF_DIR: &str = "target/bpfel-unknown-none/release";

/// Tracepoint programs as `(program, category, event)`
pub const EXEC_TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sched_fork", "sched", "sched_process_fork"),
    ("sched_exec", "sched", "sched_process_exec"),
    ("sched_exit", "sched", "sched_process_exit"),
];

pub const MEM_TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sched_fork", "sched", "sched_process_fork"),
    ("sched_exit", "sched", "sched_process_exit"),
    ("mmap_enter", "syscalls", "sys_enter_mmap"),
    ("mmap_exit", "syscalls", "sys_exit_mmap"),
    ("munmap_enter", "syscalls", "sys_enter_munmap"),
    ("brk_enter", "syscalls", "sys_enter_brk"),
    ("brk_exit", "syscalls", "sys_exit_brk"),
    ("execve_enter", "syscalls", "sys_enter_execve"),
];

/// A libc entry point and its probe programs
#[derive(Debug, Clone, Copy)]
pub struct LibcProbe {
    pub symbol: &'static str,
    pub entry: &'static str,
    pub ret: Option<&'static str>,
    /// Attachment failure aborts the session
    pub required: bool,
}

pub const LIBC_PROBES: &[LibcProbe] = &[
    LibcProbe { symbol: "malloc", entry: "malloc_enter", ret: Some("malloc_return"), required: true },
    LibcProbe { symbol: "free", entry: "free_enter", ret: None, required: true },
    LibcProbe { symbol: "calloc", entry: "calloc_enter", ret: Some("calloc_return"), required: false },
    LibcProbe {
        symbol: "realloc",
        entry: "realloc_enter",
        ret: Some("realloc_return"),
        required: false,
    },
    LibcProbe {
        symbol: "aligned_alloc",
        entry: "aligned_alloc_enter",
        ret: Some("aligned_alloc_return"),
        required: false,
    },
    LibcProbe {
        symbol: "memalign",
        entry: "memalign_enter",
        ret: Some("memalign_return"),
        required: false,
    },
];

/// Control plane over an object's ancestry maps
pub trait ProcessTracking {
    /// Mark `pid` as a tracked root
    ///
    /// # Errors
    /// Returns an error if the map update fails (e.g. the map is full)
    fn arm(&mut self, pid: Pid) -> Result<()>;

    /// Forget `pid`; descendants armed through it stay tracked
    ///
    /// # Errors
    /// Returns an error if the map is unavailable
    fn disarm(&mut self, pid: Pid) -> Result<()>;
}

/// Lift `RLIMIT_MEMLOCK` so ring buffers can be allocated on pre-5.11 kernels
///
/// # Errors
/// Returns an error if `setrlimit` fails
#[allow(unsafe_code)]
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };

    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) };
    if ret != 0 {
        anyhow::bail!("Failed to increase RLIMIT_MEMLOCK: {}", std::io::Error::last_os_error());
    }
    Ok(())
}
