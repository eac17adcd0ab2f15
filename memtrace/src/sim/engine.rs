//! Host-side instance of both kernel objects
//!
//! [`Engine`] owns one copy of every map the two eBPF objects declare and
//! exposes one method per kernel hook. Each call runs the same program body
//! the kernel runs, on behalf of the given [`Thread`]. The engine is `Sync`,
//! so hooks may be driven from many OS threads at once.

use memtrace_common::{
    ancestry, AllocProgram, AllocRecord, ExecProgram, MmapArgs, ProcessRecord, ReallocArgs,
    SizedPrimitive, TaskContext, COMM_LEN, MAX_ENTRIES, RING_BUF_BYTES, TRACKING_ENABLED_KEY,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::maps::{BoundedMap, HostAncestry};
use super::ring::EventRing;

/// A traced task, identified the way `bpf_get_current_pid_tgid` does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    pub pid: u32,
    pub tid: u32,
}

impl Thread {
    /// The thread-group leader of `pid`
    #[must_use]
    pub const fn main(pid: u32) -> Self {
        Self { pid, tid: pid }
    }

    #[must_use]
    pub const fn worker(pid: u32, tid: u32) -> Self {
        Self { pid, tid }
    }

    #[must_use]
    pub const fn pid_tgid(self) -> u64 {
        memtrace_common::pid_tgid(self.pid, self.tid)
    }
}

/// Strictly increasing nanosecond ticks
#[derive(Debug, Default)]
pub struct MonotonicClock {
    now: AtomicU64,
}

impl MonotonicClock {
    pub fn tick(&self) -> u64 {
        self.now.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Sizes of the engine's tables and channels
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_entries: usize,
    pub ring_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_entries: MAX_ENTRIES as usize, ring_bytes: RING_BUF_BYTES as usize }
    }
}

/// Maps of the lifecycle object
#[derive(Debug)]
struct ExecObject {
    ancestry: HostAncestry,
    events: EventRing<ProcessRecord>,
}

/// Maps of the allocation object
#[derive(Debug)]
struct MemObject {
    ancestry: HostAncestry,
    events: EventRing<AllocRecord>,
    enabled: BoundedMap<u32, u8>,
    malloc: BoundedMap<u64, u64>,
    calloc: BoundedMap<u64, u64>,
    aligned_alloc: BoundedMap<u64, u64>,
    memalign: BoundedMap<u64, u64>,
    realloc: BoundedMap<u64, ReallocArgs>,
    mmap: BoundedMap<u64, MmapArgs>,
    brk: BoundedMap<u64, u64>,
}

struct SimTask<'a> {
    thread: Thread,
    engine: &'a Engine,
}

impl TaskContext for SimTask<'_> {
    fn pid_tgid(&self) -> u64 {
        self.thread.pid_tgid()
    }

    fn now_ns(&self) -> u64 {
        self.engine.clock.tick()
    }

    fn comm(&self) -> [u8; COMM_LEN] {
        let names = self.engine.names.lock().unwrap_or_else(PoisonError::into_inner);
        let mut comm = [0u8; COMM_LEN];
        if let Some(name) = names.get(&self.thread.pid) {
            let len = name.len().min(COMM_LEN - 1);
            comm[..len].copy_from_slice(&name.as_bytes()[..len]);
        }
        comm
    }
}

#[derive(Debug)]
pub struct Engine {
    exec: ExecObject,
    mem: MemObject,
    clock: MonotonicClock,
    /// Command names by pid, inherited on fork and replaced on exec
    names: Mutex<HashMap<u32, String>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let table = || BoundedMap::with_max_entries(config.max_entries);
        Self {
            exec: ExecObject {
                ancestry: HostAncestry::with_max_entries(config.max_entries),
                events: EventRing::with_byte_size(config.ring_bytes),
            },
            mem: MemObject {
                ancestry: HostAncestry::with_max_entries(config.max_entries),
                events: EventRing::with_byte_size(config.ring_bytes),
                enabled: BoundedMap::with_max_entries(1),
                malloc: table(),
                calloc: table(),
                aligned_alloc: table(),
                memalign: table(),
                realloc: BoundedMap::with_max_entries(config.max_entries),
                mmap: BoundedMap::with_max_entries(config.max_entries),
                brk: table(),
            },
            clock: MonotonicClock::default(),
            names: Mutex::new(HashMap::new()),
        }
    }

    fn task(&self, thread: Thread) -> SimTask<'_> {
        SimTask { thread, engine: self }
    }

    fn exec_program(&self) -> ExecProgram<'_, HostAncestry, EventRing<ProcessRecord>> {
        ExecProgram::new(&self.exec.ancestry, &self.exec.events)
    }

    fn alloc_program(
        &self,
    ) -> AllocProgram<'_, HostAncestry, EventRing<AllocRecord>, BoundedMap<u32, u8>> {
        AllocProgram::new(&self.mem.ancestry, &self.mem.events, &self.mem.enabled)
    }

    /// Pending table of a probed primitive, `None` for one with no probe
    fn sized_table(&self, primitive: SizedPrimitive) -> Option<&BoundedMap<u64, u64>> {
        match primitive {
            SizedPrimitive::MALLOC => Some(&self.mem.malloc),
            SizedPrimitive::CALLOC => Some(&self.mem.calloc),
            SizedPrimitive::MEMALIGN => Some(&self.mem.memalign),
            SizedPrimitive::ALIGNED_ALLOC => Some(&self.mem.aligned_alloc),
            _ => None,
        }
    }

    fn names(&self) -> std::sync::MutexGuard<'_, HashMap<u32, String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Mark `pid` as a tracked root in both objects
    ///
    /// Returns `false` if either table is full.
    pub fn arm(&self, pid: u32) -> bool {
        let exec = ancestry::arm(&self.exec.ancestry, pid);
        let mem = ancestry::arm(&self.mem.ancestry, pid);
        exec && mem
    }

    pub fn disarm(&self, pid: u32) {
        ancestry::handle_exit(&self.exec.ancestry, pid);
        ancestry::handle_exit(&self.mem.ancestry, pid);
    }

    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.mem.enabled.insert(TRACKING_ENABLED_KEY, u8::from(enabled));
    }

    /// Whether the lifecycle object considers `pid` tracked
    #[must_use]
    pub fn is_tracked(&self, pid: u32) -> bool {
        ancestry::is_tracked(&self.exec.ancestry, pid)
    }

    /// Whether the allocation object considers `pid` tracked
    #[must_use]
    pub fn is_tracked_for_alloc(&self, pid: u32) -> bool {
        ancestry::is_tracked(&self.mem.ancestry, pid)
    }

    pub fn set_comm(&self, pid: u32, name: &str) {
        self.names().insert(pid, name.to_string());
    }

    // ------------------------------------------------------------------
    // Scheduler tracepoints
    // ------------------------------------------------------------------

    /// `thread` forks `child_pid`
    pub fn fork(&self, thread: Thread, child_pid: u32) -> bool {
        {
            let mut names = self.names();
            if let Some(name) = names.get(&thread.pid).cloned() {
                names.insert(child_pid, name);
            }
        }
        let task = self.task(thread);
        self.alloc_program().on_fork(thread.tid, child_pid);
        self.exec_program().on_fork(&task, thread.tid, child_pid)
    }

    /// `thread` creates a new thread `tid` in its own process
    ///
    /// The kernel reports thread creation through the same fork tracepoint.
    pub fn spawn_thread(&self, thread: Thread, tid: u32) -> Thread {
        self.fork(thread, tid);
        Thread::worker(thread.pid, tid)
    }

    /// `thread` replaces its image with `name`
    pub fn exec(&self, thread: Thread, name: &str) -> bool {
        self.set_comm(thread.pid, name);
        self.exec_program().on_exec(&self.task(thread))
    }

    pub fn exit(&self, thread: Thread) -> bool {
        let task = self.task(thread);
        self.alloc_program().on_exit(&task);
        self.exec_program().on_exit(&task)
    }

    // ------------------------------------------------------------------
    // libc probes
    // ------------------------------------------------------------------

    pub fn sized_enter(&self, thread: Thread, primitive: SizedPrimitive, arg0: u64, arg1: u64) -> bool {
        let Some(table) = self.sized_table(primitive) else {
            return false;
        };
        self.alloc_program().sized_enter(&self.task(thread), table, primitive, arg0, arg1)
    }

    pub fn sized_return(&self, thread: Thread, primitive: SizedPrimitive, ret: u64) -> bool {
        let Some(table) = self.sized_table(primitive) else {
            return false;
        };
        self.alloc_program().sized_return(&self.task(thread), table, primitive, ret)
    }

    pub fn malloc_enter(&self, thread: Thread, size: u64) -> bool {
        self.sized_enter(thread, SizedPrimitive::MALLOC, size, 0)
    }

    pub fn malloc_return(&self, thread: Thread, ret: u64) -> bool {
        self.sized_return(thread, SizedPrimitive::MALLOC, ret)
    }

    pub fn calloc_enter(&self, thread: Thread, nmemb: u64, size: u64) -> bool {
        self.sized_enter(thread, SizedPrimitive::CALLOC, nmemb, size)
    }

    pub fn calloc_return(&self, thread: Thread, ret: u64) -> bool {
        self.sized_return(thread, SizedPrimitive::CALLOC, ret)
    }

    pub fn realloc_enter(&self, thread: Thread, old_addr: u64, size: u64) -> bool {
        self.alloc_program().realloc_enter(&self.task(thread), &self.mem.realloc, old_addr, size)
    }

    pub fn realloc_return(&self, thread: Thread, ret: u64) -> bool {
        self.alloc_program().realloc_return(&self.task(thread), &self.mem.realloc, ret)
    }

    pub fn free(&self, thread: Thread, addr: u64) -> bool {
        self.alloc_program().free(&self.task(thread), addr)
    }

    // ------------------------------------------------------------------
    // Syscall tracepoints
    // ------------------------------------------------------------------

    pub fn mmap_enter(&self, thread: Thread, addr: u64, len: u64) -> bool {
        self.alloc_program().mmap_enter(&self.task(thread), &self.mem.mmap, addr, len)
    }

    pub fn mmap_exit(&self, thread: Thread, ret: i64) -> bool {
        self.alloc_program().mmap_exit(&self.task(thread), &self.mem.mmap, ret)
    }

    pub fn munmap(&self, thread: Thread, addr: u64, len: u64) -> bool {
        self.alloc_program().munmap(&self.task(thread), addr, len)
    }

    pub fn brk_enter(&self, thread: Thread, requested: u64) -> bool {
        self.alloc_program().brk_enter(&self.task(thread), &self.mem.brk, requested)
    }

    pub fn brk_exit(&self, thread: Thread, ret: i64) -> bool {
        self.alloc_program().brk_exit(&self.task(thread), &self.mem.brk, ret)
    }

    pub fn execve(&self, thread: Thread) -> bool {
        self.alloc_program().execve(&self.task(thread))
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    pub fn drain_process(&self) -> Vec<ProcessRecord> {
        self.exec.events.drain()
    }

    pub fn drain_alloc(&self) -> Vec<AllocRecord> {
        self.mem.events.drain()
    }

    /// Records dropped for lack of space as `(process, alloc)`
    pub fn dropped(&self) -> (u64, u64) {
        (self.exec.events.dropped(), self.mem.events.dropped())
    }

    /// Pending correlation entries across all call sites
    pub fn pending_calls(&self) -> usize {
        self.mem.malloc.len()
            + self.mem.calloc.len()
            + self.mem.aligned_alloc.len()
            + self.mem.memalign.len()
            + self.mem.realloc.len()
            + self.mem.mmap.len()
            + self.mem.brk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace_common::AllocKind;

    #[test]
    fn test_engine_is_sync() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<Engine>();
    }

    #[test]
    fn test_memalign_uses_own_table() {
        let engine = Engine::default();
        let t = Thread::main(10);
        engine.arm(10);

        engine.sized_enter(t, SizedPrimitive::MEMALIGN, 64, 100);
        engine.sized_enter(t, SizedPrimitive::ALIGNED_ALLOC, 64, 200);
        assert!(engine.sized_return(t, SizedPrimitive::MEMALIGN, 0x40));
        assert!(engine.sized_return(t, SizedPrimitive::ALIGNED_ALLOC, 0x80));

        let kinds: Vec<_> = engine.drain_alloc().iter().filter_map(AllocRecord::kind).collect();
        assert_eq!(
            kinds,
            vec![
                AllocKind::AlignedAlloc { addr: 0x40, size: 100 },
                AllocKind::AlignedAlloc { addr: 0x80, size: 200 },
            ]
        );
        assert_eq!(engine.pending_calls(), 0);
    }

    #[test]
    fn test_comm_follows_fork_and_exec() {
        let engine = Engine::default();
        engine.arm(1);
        engine.set_comm(1, "a-very-long-command-name");
        engine.fork(Thread::main(1), 2);
        engine.exec(Thread::main(2), "bench");

        let records = engine.drain_process();
        assert_eq!(records[0].comm_str(), "a-very-long-com");
        assert_eq!(records[1].comm_str(), "bench");
    }

    #[test]
    fn test_unprobed_primitive_has_no_table() {
        use memtrace_common::{SizeRule, SizedEvent};

        let engine = Engine::default();
        let t = Thread::main(10);
        engine.arm(10);
        let valloc =
            SizedPrimitive { symbol: "valloc", rule: SizeRule::FirstArg, event: SizedEvent::Malloc };

        assert!(!engine.sized_enter(t, valloc, 64, 0));
        assert_eq!(engine.pending_calls(), 0);

        // must not consume an aligned_alloc entry either
        engine.sized_enter(t, SizedPrimitive::ALIGNED_ALLOC, 64, 128);
        assert!(!engine.sized_return(t, valloc, 0x80));
        assert_eq!(engine.pending_calls(), 1);
    }
}
