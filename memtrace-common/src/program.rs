//! Hook bodies shared by the kernel objects and the host engine
//!
//! [`ExecProgram`] drives the lifecycle hooks of `exectrack`; [`AllocProgram`]
//! drives the allocator and syscall hooks of `memtrack`. Each hook method is
//! one kernel program invocation: it reads the current task through
//! [`TaskContext`], consults the ancestry maps, and pushes at most one record.
//!
//! Return values say whether a record was accepted by the sink. The kernel
//! shells ignore them; tests use them.

use crate::ancestry::{handle_exit, handle_fork, is_tracked, AncestryMaps};
use crate::correlation::{record_entry, MmapArgs, PendingCalls, ReallocArgs, SizedPrimitive};
use crate::event::{AllocKind, AllocRecord, ProcessEventType, ProcessRecord, COMM_LEN};
use crate::{pid_of, tid_of};

/// The task the hook is running on behalf of
pub trait TaskContext {
    fn pid_tgid(&self) -> u64;

    /// Monotonic boot-relative nanoseconds
    fn now_ns(&self) -> u64;

    fn comm(&self) -> [u8; COMM_LEN];
}

/// Bounded non-blocking event channel
pub trait EventSink<T> {
    /// Returns `false` when the record was dropped for lack of space
    fn submit(&self, record: &T) -> bool;
}

/// Runtime emission switch for allocation events
pub trait EnableFlag {
    fn is_enabled(&self) -> bool;
}

/// Lifecycle hooks (fork, exec, exit)
pub struct ExecProgram<'a, M: ?Sized, S: ?Sized> {
    ancestry: &'a M,
    events: &'a S,
}

impl<'a, M, S> ExecProgram<'a, M, S>
where
    M: AncestryMaps + ?Sized,
    S: EventSink<ProcessRecord> + ?Sized,
{
    pub const fn new(ancestry: &'a M, events: &'a S) -> Self {
        Self { ancestry, events }
    }

    /// `sched_process_fork`: propagate tracking and report the new child
    pub fn on_fork<T: TaskContext + ?Sized>(&self, task: &T, parent_pid: u32, child_pid: u32) -> bool {
        if !handle_fork(self.ancestry, parent_pid, child_pid) {
            return false;
        }
        self.emit(task, ProcessEventType::Fork, child_pid, parent_pid)
    }

    /// `sched_process_exec`
    pub fn on_exec<T: TaskContext + ?Sized>(&self, task: &T) -> bool {
        let pid = pid_of(task.pid_tgid());
        if !is_tracked(self.ancestry, pid) {
            return false;
        }
        self.emit(task, ProcessEventType::Exec, pid, 0)
    }

    /// `sched_process_exit`, fired once per exiting task
    ///
    /// Only the group leader's exit ends the process. A worker thread exiting
    /// just drops its own entry.
    pub fn on_exit<T: TaskContext + ?Sized>(&self, task: &T) -> bool {
        let pid_tgid = task.pid_tgid();
        let (pid, tid) = (pid_of(pid_tgid), tid_of(pid_tgid));
        if !is_tracked(self.ancestry, pid) {
            return false;
        }
        if tid != pid {
            handle_exit(self.ancestry, tid);
            return false;
        }

        let emitted = self.emit(task, ProcessEventType::Exit, pid, 0);
        handle_exit(self.ancestry, pid);
        emitted
    }

    fn emit<T: TaskContext + ?Sized>(
        &self,
        task: &T,
        kind: ProcessEventType,
        pid: u32,
        ppid: u32,
    ) -> bool {
        let record =
            ProcessRecord::new(kind, task.now_ns(), pid, tid_of(task.pid_tgid()), ppid, task.comm());
        self.events.submit(&record)
    }
}

/// Allocator and memory-mapping hooks
///
/// Pending tables are passed per call so each call site keeps its own table.
/// Entry hooks only look at ancestry; emission additionally requires the
/// enable flag, so a call entered while disabled is still reported if the
/// flag is back on at return time.
pub struct AllocProgram<'a, M: ?Sized, S: ?Sized, F: ?Sized> {
    ancestry: &'a M,
    events: &'a S,
    enabled: &'a F,
}

impl<'a, M, S, F> AllocProgram<'a, M, S, F>
where
    M: AncestryMaps + ?Sized,
    S: EventSink<AllocRecord> + ?Sized,
    F: EnableFlag + ?Sized,
{
    pub const fn new(ancestry: &'a M, events: &'a S, enabled: &'a F) -> Self {
        Self { ancestry, events, enabled }
    }

    /// Keep this object's ancestry copy in step with the tree, no event
    pub fn on_fork(&self, parent_pid: u32, child_pid: u32) -> bool {
        handle_fork(self.ancestry, parent_pid, child_pid)
    }

    /// Same leader rule as [`ExecProgram::on_exit`], no event
    pub fn on_exit<T: TaskContext + ?Sized>(&self, task: &T) {
        let pid_tgid = task.pid_tgid();
        let (pid, tid) = (pid_of(pid_tgid), tid_of(pid_tgid));
        if is_tracked(self.ancestry, pid) {
            handle_exit(self.ancestry, if tid == pid { pid } else { tid });
        }
    }

    pub fn sized_enter<T, P>(
        &self,
        task: &T,
        pending: &P,
        primitive: SizedPrimitive,
        arg0: u64,
        arg1: u64,
    ) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<u64> + ?Sized,
    {
        let size = primitive.rule.size(arg0, arg1);
        record_entry(self.ancestry, pending, task.pid_tgid(), &size)
    }

    pub fn sized_return<T, P>(&self, task: &T, pending: &P, primitive: SizedPrimitive, ret: u64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<u64> + ?Sized,
    {
        let Some(size) = pending.take(task.pid_tgid()) else {
            return false;
        };
        if ret == 0 {
            return false;
        }
        self.emit(task, primitive.report(ret, size))
    }

    pub fn realloc_enter<T, P>(&self, task: &T, pending: &P, old_addr: u64, size: u64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<ReallocArgs> + ?Sized,
    {
        record_entry(self.ancestry, pending, task.pid_tgid(), &ReallocArgs { old_addr, size })
    }

    pub fn realloc_return<T, P>(&self, task: &T, pending: &P, ret: u64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<ReallocArgs> + ?Sized,
    {
        let Some(args) = pending.take(task.pid_tgid()) else {
            return false;
        };
        if ret == 0 {
            return false;
        }
        self.emit(task, AllocKind::Realloc { old_addr: args.old_addr, new_addr: ret, size: args.size })
    }

    /// `free(ptr)`, reported on entry
    pub fn free<T: TaskContext + ?Sized>(&self, task: &T, addr: u64) -> bool {
        if addr == 0 {
            return false;
        }
        self.emit(task, AllocKind::Free { addr })
    }

    pub fn mmap_enter<T, P>(&self, task: &T, pending: &P, addr: u64, len: u64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<MmapArgs> + ?Sized,
    {
        record_entry(self.ancestry, pending, task.pid_tgid(), &MmapArgs { addr, len })
    }

    /// Negative returns are errnos
    pub fn mmap_exit<T, P>(&self, task: &T, pending: &P, ret: i64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<MmapArgs> + ?Sized,
    {
        let Some(args) = pending.take(task.pid_tgid()) else {
            return false;
        };
        if ret <= 0 {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let addr = ret as u64;
        self.emit(task, AllocKind::Mmap { addr, size: args.len })
    }

    pub fn munmap<T: TaskContext + ?Sized>(&self, task: &T, addr: u64, len: u64) -> bool {
        if addr == 0 || len == 0 {
            return false;
        }
        self.emit(task, AllocKind::Munmap { addr, size: len })
    }

    pub fn brk_enter<T, P>(&self, task: &T, pending: &P, requested: u64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<u64> + ?Sized,
    {
        record_entry(self.ancestry, pending, task.pid_tgid(), &requested)
    }

    /// `brk(0)` is a query and is never reported
    pub fn brk_exit<T, P>(&self, task: &T, pending: &P, ret: i64) -> bool
    where
        T: TaskContext + ?Sized,
        P: PendingCalls<u64> + ?Sized,
    {
        let Some(requested) = pending.take(task.pid_tgid()) else {
            return false;
        };
        if requested == 0 || ret <= 0 {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let addr = ret as u64;
        self.emit(task, AllocKind::Brk { addr, size: 0 })
    }

    pub fn execve<T: TaskContext + ?Sized>(&self, task: &T) -> bool {
        self.emit(task, AllocKind::Execve)
    }

    fn emit<T: TaskContext + ?Sized>(&self, task: &T, kind: AllocKind) -> bool {
        let pid_tgid = task.pid_tgid();
        let pid = pid_of(pid_tgid);
        if !is_tracked(self.ancestry, pid) || !self.enabled.is_enabled() {
            return false;
        }
        let record = AllocRecord::new(kind, task.now_ns(), pid, tid_of(pid_tgid));
        self.events.submit(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ancestry::{arm, testing::TestAncestry};
    use crate::correlation::testing::TestPending;
    use crate::event::AllocEventType;
    use crate::pid_tgid;
    use std::cell::{Cell, RefCell};

    struct Task(u64);

    impl TaskContext for Task {
        fn pid_tgid(&self) -> u64 {
            self.0
        }
        fn now_ns(&self) -> u64 {
            42
        }
        fn comm(&self) -> [u8; COMM_LEN] {
            *b"worker\0\0\0\0\0\0\0\0\0\0"
        }
    }

    struct Sink<T> {
        records: RefCell<Vec<T>>,
        capacity: usize,
    }

    impl<T> Sink<T> {
        fn new(capacity: usize) -> Self {
            Self { records: RefCell::new(Vec::new()), capacity }
        }
    }

    impl<T: Copy> EventSink<T> for Sink<T> {
        fn submit(&self, record: &T) -> bool {
            let mut records = self.records.borrow_mut();
            if records.len() >= self.capacity {
                return false;
            }
            records.push(*record);
            true
        }
    }

    struct Flag(Cell<bool>);

    impl EnableFlag for Flag {
        fn is_enabled(&self) -> bool {
            self.0.get()
        }
    }

    #[test]
    fn test_fork_record_reports_child_and_parent() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let program = ExecProgram::new(&ancestry, &sink);
        arm(&ancestry, 100);

        assert!(program.on_fork(&Task(pid_tgid(100, 100)), 100, 101));
        assert!(!program.on_fork(&Task(pid_tgid(7, 7)), 7, 8));

        let records = sink.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), Some(ProcessEventType::Fork));
        assert_eq!((records[0].pid, records[0].ppid, records[0].tid), (101, 100, 100));
        assert_eq!(records[0].comm_str(), "worker");
    }

    #[test]
    fn test_worker_thread_exit_keeps_process() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let program = ExecProgram::new(&ancestry, &sink);
        arm(&ancestry, 100);
        program.on_fork(&Task(pid_tgid(100, 100)), 100, 103);

        assert!(!program.on_exit(&Task(pid_tgid(100, 103))));
        assert!(is_tracked(&ancestry, 100));
        assert!(!ancestry.is_marked(103));

        assert!(program.on_exit(&Task(pid_tgid(100, 100))));
        assert!(!is_tracked(&ancestry, 100));
        assert_eq!(sink.records.borrow().last().and_then(ProcessRecord::kind), Some(ProcessEventType::Exit));
    }

    #[test]
    fn test_exit_untracks_even_when_channel_full() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(0);
        let program = ExecProgram::new(&ancestry, &sink);
        arm(&ancestry, 5);

        assert!(!program.on_exit(&Task(pid_tgid(5, 5))));
        assert!(!is_tracked(&ancestry, 5));
    }

    #[test]
    fn test_mmap_and_brk_policies() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let flag = Flag(Cell::new(true));
        let program = AllocProgram::new(&ancestry, &sink, &flag);
        let mmap = TestPending::<MmapArgs>::default();
        let brk = TestPending::<u64>::default();
        let task = Task(pid_tgid(9, 9));
        arm(&ancestry, 9);

        program.mmap_enter(&task, &mmap, 0, 4096);
        assert!(!program.mmap_exit(&task, &mmap, -12));
        program.mmap_enter(&task, &mmap, 0, 4096);
        assert!(program.mmap_exit(&task, &mmap, 0x7000_0000));

        program.brk_enter(&task, &brk, 0);
        assert!(!program.brk_exit(&task, &brk, 0x5000));
        program.brk_enter(&task, &brk, 0x6000);
        assert!(program.brk_exit(&task, &brk, 0x6000));

        assert!(!program.munmap(&task, 0, 4096));
        assert!(!program.munmap(&task, 0x7000_0000, 0));
        assert!(program.munmap(&task, 0x7000_0000, 4096));

        let kinds: Vec<_> = sink.records.borrow().iter().filter_map(AllocRecord::kind).collect();
        assert_eq!(
            kinds,
            vec![
                AllocKind::Mmap { addr: 0x7000_0000, size: 4096 },
                AllocKind::Brk { addr: 0x6000, size: 0 },
                AllocKind::Munmap { addr: 0x7000_0000, size: 4096 },
            ]
        );
    }

    #[test]
    fn test_realloc_pairs_old_and_new() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let flag = Flag(Cell::new(true));
        let program = AllocProgram::new(&ancestry, &sink, &flag);
        let pending = TestPending::<ReallocArgs>::default();
        let task = Task(pid_tgid(3, 4));
        arm(&ancestry, 3);

        program.realloc_enter(&task, &pending, 0x100, 512);
        assert!(program.realloc_return(&task, &pending, 0x900));
        program.realloc_enter(&task, &pending, 0x900, 0);
        assert!(!program.realloc_return(&task, &pending, 0));

        let records = sink.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.tid, 4);
        assert_eq!(
            records[0].kind(),
            Some(AllocKind::Realloc { old_addr: 0x100, new_addr: 0x900, size: 512 })
        );
    }

    #[test]
    fn test_disabled_flag_still_correlates() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let flag = Flag(Cell::new(false));
        let program = AllocProgram::new(&ancestry, &sink, &flag);
        let pending = TestPending::<u64>::default();
        let task = Task(pid_tgid(1, 1));
        arm(&ancestry, 1);

        assert!(program.sized_enter(&task, &pending, SizedPrimitive::CALLOC, 4, 8));
        assert!(!program.free(&task, 0xdead));
        flag.0.set(true);
        assert!(program.sized_return(&task, &pending, SizedPrimitive::CALLOC, 0xbeef));

        let records = sink.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.event_type, AllocEventType::Calloc as u8);
        assert_eq!(records[0].payload[..2], [0xbeef, 32]);
    }

    #[test]
    fn test_free_null_and_execve_marker() {
        let ancestry = TestAncestry::default();
        let sink = Sink::new(16);
        let flag = Flag(Cell::new(true));
        let program = AllocProgram::new(&ancestry, &sink, &flag);
        let task = Task(pid_tgid(2, 2));
        arm(&ancestry, 2);

        assert!(!program.free(&task, 0));
        assert!(program.execve(&task));
        assert_eq!(sink.records.borrow()[0].kind(), Some(AllocKind::Execve));
    }
}
