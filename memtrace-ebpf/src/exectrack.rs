//! # exectrack - process lifecycle tracking
//!
//! Follows the tracked process trees through the scheduler tracepoints and
//! reports fork, exec and exit of tracked processes.
//!
//! ## Programs
//!
//! - `sched_fork` - `sched/sched_process_fork`
//! - `sched_exec` - `sched/sched_process_exec`
//! - `sched_exit` - `sched/sched_process_exit`
//!
//! ## Maps (Shared with Userspace)
//!
//! - `TRACKED_PIDS` - presence markers, roots are armed by userspace
//! - `PID_PARENTS` - child -> parent links written on propagated forks
//! - `EVENTS` - ring buffer of `ProcessRecord`
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    macros::{map, tracepoint},
    maps::{HashMap, RingBuf},
    programs::TracePointContext,
};
use aya_log_ebpf::debug;
use memtrace_common::{
    kernel::{CurrentTask, KernelAncestry},
    tracepoint::SchedProcessForkArgs,
    ExecProgram, MAX_ENTRIES, RING_BUF_BYTES,
};

#[map]
static TRACKED_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static PID_PARENTS: HashMap<u32, u32> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTES, 0);

static ANCESTRY: KernelAncestry = KernelAncestry::new(&TRACKED_PIDS, &PID_PARENTS);

#[inline(always)]
fn program() -> ExecProgram<'static, KernelAncestry, RingBuf> {
    ExecProgram::new(&ANCESTRY, &EVENTS)
}

#[tracepoint]
pub fn sched_fork(ctx: TracePointContext) -> u32 {
    match try_sched_fork(&ctx) {
        Ok(()) | Err(_) => 0,
    }
}

fn try_sched_fork(ctx: &TracePointContext) -> Result<(), i64> {
    let parent_pid: i32 = unsafe { ctx.read_at(SchedProcessForkArgs::PARENT_PID_OFFSET)? };
    let child_pid: i32 = unsafe { ctx.read_at(SchedProcessForkArgs::CHILD_PID_OFFSET)? };

    if program().on_fork(&CurrentTask, parent_pid as u32, child_pid as u32) {
        debug!(ctx, "fork {} -> {}", parent_pid, child_pid);
    }
    Ok(())
}

#[tracepoint]
pub fn sched_exec(_ctx: TracePointContext) -> u32 {
    program().on_exec(&CurrentTask);
    0
}

#[tracepoint]
pub fn sched_exit(_ctx: TracePointContext) -> u32 {
    program().on_exit(&CurrentTask);
    0
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
