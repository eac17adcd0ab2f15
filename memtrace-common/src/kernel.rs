//! aya-ebpf adapters
//!
//! Implements the program traits over kernel maps and BPF helpers so the
//! hook bodies in [`crate::program`] can run inside the eBPF objects.
//! Compiled only with the `ebpf` feature.

#![allow(unsafe_code)]

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns};
use aya_ebpf::maps::{HashMap, RingBuf};

use crate::ancestry::AncestryMaps;
use crate::correlation::PendingCalls;
use crate::event::COMM_LEN;
use crate::program::{EnableFlag, EventSink, TaskContext};
use crate::TRACKING_ENABLED_KEY;

/// The two ancestry maps of one eBPF object
pub struct KernelAncestry {
    tracked: &'static HashMap<u32, u8>,
    parents: &'static HashMap<u32, u32>,
}

impl KernelAncestry {
    #[must_use]
    pub const fn new(tracked: &'static HashMap<u32, u8>, parents: &'static HashMap<u32, u32>) -> Self {
        Self { tracked, parents }
    }
}

impl AncestryMaps for KernelAncestry {
    #[inline(always)]
    fn is_marked(&self, pid: u32) -> bool {
        // SAFETY: the value is only tested for presence
        unsafe { self.tracked.get(&pid).is_some() }
    }

    #[inline(always)]
    fn parent_of(&self, pid: u32) -> Option<u32> {
        // SAFETY: copied out immediately
        unsafe { self.parents.get(&pid).copied() }
    }

    #[inline(always)]
    fn mark(&self, pid: u32) -> bool {
        self.tracked.insert(&pid, &1, 0).is_ok()
    }

    #[inline(always)]
    fn link(&self, child: u32, parent: u32) -> bool {
        self.parents.insert(&child, &parent, 0).is_ok()
    }

    #[inline(always)]
    fn forget(&self, pid: u32) {
        let _ = self.tracked.remove(&pid);
        let _ = self.parents.remove(&pid);
    }
}

impl<V: Copy> PendingCalls<V> for HashMap<u64, V> {
    #[inline(always)]
    fn stash(&self, pid_tgid: u64, args: &V) -> bool {
        self.insert(&pid_tgid, args, 0).is_ok()
    }

    #[inline(always)]
    fn take(&self, pid_tgid: u64) -> Option<V> {
        // SAFETY: copied out before the entry is deleted
        let value = unsafe { self.get(&pid_tgid).copied() }?;
        let _ = self.remove(&pid_tgid);
        Some(value)
    }
}

impl<T: Copy + 'static> EventSink<T> for RingBuf {
    #[inline(always)]
    fn submit(&self, record: &T) -> bool {
        match self.reserve::<T>(0) {
            Some(mut entry) => {
                entry.write(*record);
                entry.submit(0);
                true
            }
            None => false,
        }
    }
}

/// Absent means enabled, so a freshly loaded object reports by default
impl EnableFlag for HashMap<u32, u8> {
    #[inline(always)]
    fn is_enabled(&self) -> bool {
        // SAFETY: copied out immediately
        unsafe { self.get(&TRACKING_ENABLED_KEY).copied() }.map_or(true, |flag| flag != 0)
    }
}

/// The task currently running the program
pub struct CurrentTask;

impl TaskContext for CurrentTask {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        // SAFETY: plain helper call
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn comm(&self) -> [u8; COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; COMM_LEN])
    }
}
