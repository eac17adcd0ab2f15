//! # memtrack - allocator and memory-mapping tracking
//!
//! Reports heap and mapping activity of the tracked process trees.
//!
//! ## Programs
//!
//! - libc uprobe/uretprobe pairs: `malloc`, `calloc`, `realloc`,
//!   `aligned_alloc`, `memalign`; uprobe only: `free`
//! - syscall tracepoints: `mmap` (enter/exit), `munmap` (enter),
//!   `brk` (enter/exit), `execve` (enter)
//! - `sched_fork` / `sched_exit` keep this object's ancestry maps current,
//!   nothing is emitted from them
//!
//! ## Maps (Shared with Userspace)
//!
//! - `TRACKED_PIDS`, `PID_PARENTS` - ancestry, separate from `exectrack`
//! - `TRACKING_ENABLED` - key 0; absent or non-zero means events are emitted
//! - `EVENTS` - ring buffer of `AllocRecord`
//!
//! Pending-call tables are private to the object, one per call site.

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    macros::{map, tracepoint, uprobe, uretprobe},
    maps::{HashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use memtrace_common::{
    kernel::{CurrentTask, KernelAncestry},
    tracepoint::{SchedProcessForkArgs, SysEnterArgs, SysExitArgs},
    AllocProgram, MmapArgs, ReallocArgs, SizedPrimitive, MAX_ENTRIES, RING_BUF_BYTES,
};

#[map]
static TRACKED_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static PID_PARENTS: HashMap<u32, u32> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static TRACKING_ENABLED: HashMap<u32, u8> = HashMap::with_max_entries(1, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTES, 0);

#[map]
static MALLOC_SIZES: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static CALLOC_SIZES: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static ALIGNED_ALLOC_SIZES: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static MEMALIGN_SIZES: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static REALLOC_ARGS: HashMap<u64, ReallocArgs> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static MMAP_ARGS: HashMap<u64, MmapArgs> = HashMap::with_max_entries(MAX_ENTRIES, 0);

#[map]
static BRK_ARGS: HashMap<u64, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

static ANCESTRY: KernelAncestry = KernelAncestry::new(&TRACKED_PIDS, &PID_PARENTS);

#[inline(always)]
fn program() -> AllocProgram<'static, KernelAncestry, RingBuf, HashMap<u32, u8>> {
    AllocProgram::new(&ANCESTRY, &EVENTS, &TRACKING_ENABLED)
}

// ============================================================================
// Ancestry upkeep
// ============================================================================

#[tracepoint]
pub fn sched_fork(ctx: TracePointContext) -> u32 {
    match try_sched_fork(&ctx) {
        Ok(()) | Err(_) => 0,
    }
}

fn try_sched_fork(ctx: &TracePointContext) -> Result<(), i64> {
    let parent_pid: i32 = unsafe { ctx.read_at(SchedProcessForkArgs::PARENT_PID_OFFSET)? };
    let child_pid: i32 = unsafe { ctx.read_at(SchedProcessForkArgs::CHILD_PID_OFFSET)? };
    program().on_fork(parent_pid as u32, child_pid as u32);
    Ok(())
}

#[tracepoint]
pub fn sched_exit(_ctx: TracePointContext) -> u32 {
    program().on_exit(&CurrentTask);
    0
}

// ============================================================================
// libc allocator probes
// ============================================================================

/// Entry/return pair for a primitive returning a fresh pointer of a given size
macro_rules! sized_probes {
    ($enter:ident, $ret:ident, $table:ident, $primitive:expr) => {
        #[uprobe]
        pub fn $enter(ctx: ProbeContext) -> u32 {
            let arg0: u64 = ctx.arg(0).unwrap_or(0);
            let arg1: u64 = ctx.arg(1).unwrap_or(0);
            program().sized_enter(&CurrentTask, &$table, $primitive, arg0, arg1);
            0
        }

        #[uretprobe]
        pub fn $ret(ctx: RetProbeContext) -> u32 {
            let ret: u64 = ctx.ret().unwrap_or(0);
            program().sized_return(&CurrentTask, &$table, $primitive, ret);
            0
        }
    };
}

sized_probes!(malloc_enter, malloc_return, MALLOC_SIZES, SizedPrimitive::MALLOC);
sized_probes!(calloc_enter, calloc_return, CALLOC_SIZES, SizedPrimitive::CALLOC);
sized_probes!(
    aligned_alloc_enter,
    aligned_alloc_return,
    ALIGNED_ALLOC_SIZES,
    SizedPrimitive::ALIGNED_ALLOC
);
sized_probes!(memalign_enter, memalign_return, MEMALIGN_SIZES, SizedPrimitive::MEMALIGN);

#[uprobe]
pub fn realloc_enter(ctx: ProbeContext) -> u32 {
    let old_addr: u64 = ctx.arg(0).unwrap_or(0);
    let size: u64 = ctx.arg(1).unwrap_or(0);
    program().realloc_enter(&CurrentTask, &REALLOC_ARGS, old_addr, size);
    0
}

#[uretprobe]
pub fn realloc_return(ctx: RetProbeContext) -> u32 {
    let ret: u64 = ctx.ret().unwrap_or(0);
    program().realloc_return(&CurrentTask, &REALLOC_ARGS, ret);
    0
}

#[uprobe]
pub fn free_enter(ctx: ProbeContext) -> u32 {
    let addr: u64 = ctx.arg(0).unwrap_or(0);
    program().free(&CurrentTask, addr);
    0
}

// ============================================================================
// Syscall tracepoints
// ============================================================================

#[inline(always)]
fn syscall_arg(ctx: &TracePointContext, n: usize) -> Result<u64, i64> {
    unsafe { ctx.read_at::<u64>(SysEnterArgs::arg_offset(n)) }
}

#[inline(always)]
fn syscall_ret(ctx: &TracePointContext) -> Result<i64, i64> {
    unsafe { ctx.read_at::<i64>(SysExitArgs::RET_OFFSET) }
}

#[tracepoint]
pub fn mmap_enter(ctx: TracePointContext) -> u32 {
    match try_mmap_enter(&ctx) {
        Ok(()) | Err(_) => 0,
    }
}

fn try_mmap_enter(ctx: &TracePointContext) -> Result<(), i64> {
    let addr = syscall_arg(ctx, 0)?;
    let len = syscall_arg(ctx, 1)?;
    program().mmap_enter(&CurrentTask, &MMAP_ARGS, addr, len);
    Ok(())
}

#[tracepoint]
pub fn mmap_exit(ctx: TracePointContext) -> u32 {
    match syscall_ret(&ctx) {
        Ok(ret) => {
            program().mmap_exit(&CurrentTask, &MMAP_ARGS, ret);
            0
        }
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn munmap_enter(ctx: TracePointContext) -> u32 {
    match try_munmap_enter(&ctx) {
        Ok(()) | Err(_) => 0,
    }
}

fn try_munmap_enter(ctx: &TracePointContext) -> Result<(), i64> {
    let addr = syscall_arg(ctx, 0)?;
    let len = syscall_arg(ctx, 1)?;
    program().munmap(&CurrentTask, addr, len);
    Ok(())
}

#[tracepoint]
pub fn brk_enter(ctx: TracePointContext) -> u32 {
    match syscall_arg(&ctx, 0) {
        Ok(requested) => {
            program().brk_enter(&CurrentTask, &BRK_ARGS, requested);
            0
        }
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn brk_exit(ctx: TracePointContext) -> u32 {
    match syscall_ret(&ctx) {
        Ok(ret) => {
            program().brk_exit(&CurrentTask, &BRK_ARGS, ret);
            0
        }
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn execve_enter(_ctx: TracePointContext) -> u32 {
    program().execve(&CurrentTask);
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
