//! Raw tracepoint argument layouts
//!
//! Offsets follow `/sys/kernel/tracing/events/<group>/<event>/format`. Every
//! record starts with the 8-byte common header.

use crate::event::COMM_LEN;

/// `sched/sched_process_fork`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SchedProcessForkArgs {
    pub common: u64,
    pub parent_comm: [u8; COMM_LEN],
    pub parent_pid: i32,
    pub child_comm: [u8; COMM_LEN],
    pub child_pid: i32,
}

/// `syscalls/sys_enter_*`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SysEnterArgs {
    pub common: u64,
    pub syscall_nr: i32,
    _pad: u32,
    pub args: [u64; 6],
}

/// `syscalls/sys_exit_*`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SysExitArgs {
    pub common: u64,
    pub syscall_nr: i32,
    _pad: u32,
    pub ret: i64,
}

impl SchedProcessForkArgs {
    pub const PARENT_PID_OFFSET: usize = core::mem::offset_of!(Self, parent_pid);
    pub const CHILD_PID_OFFSET: usize = core::mem::offset_of!(Self, child_pid);
}

impl SysEnterArgs {
    /// Offset of syscall argument `n`
    #[must_use]
    pub const fn arg_offset(n: usize) -> usize {
        core::mem::offset_of!(Self, args) + n * core::mem::size_of::<u64>()
    }
}

impl SysExitArgs {
    pub const RET_OFFSET: usize = core::mem::offset_of!(Self, ret);
}
