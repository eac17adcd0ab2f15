//! Process tree reconstruction from lifecycle events

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::Pid;
use crate::events::{EventKind, TraceEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Last command name seen (fork inherits the parent's, exec replaces it)
    pub name: String,
    pub start_time_ns: u64,
    pub stop_time_ns: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHierarchy {
    pub root_pid: Option<Pid>,
    pub processes: BTreeMap<u32, ProcessInfo>,
    /// Parent pid -> children in fork order
    pub children: BTreeMap<u32, Vec<Pid>>,
}

/// Folds lifecycle events into a [`ProcessHierarchy`]
///
/// Allocation events are ignored. Events should be fed in timestamp order.
#[derive(Debug, Default)]
pub struct HierarchyBuilder {
    hierarchy: ProcessHierarchy,
}

impl HierarchyBuilder {
    #[must_use]
    pub fn new(root_pid: Pid) -> Self {
        Self { hierarchy: ProcessHierarchy { root_pid: Some(root_pid), ..ProcessHierarchy::default() } }
    }

    pub fn process_event(&mut self, event: &TraceEvent) {
        let pid = event.pid;
        match &event.kind {
            EventKind::Fork { ppid, comm } => {
                self.hierarchy
                    .processes
                    .entry(pid.0)
                    .or_insert_with(|| ProcessInfo {
                        pid,
                        name: comm.clone(),
                        start_time_ns: event.timestamp_ns,
                        stop_time_ns: None,
                    });
                self.hierarchy.children.entry(ppid.0).or_default().push(pid);
            }
            EventKind::Exec { comm } => {
                self.hierarchy
                    .processes
                    .entry(pid.0)
                    .and_modify(|p| p.name.clone_from(comm))
                    .or_insert_with(|| ProcessInfo {
                        pid,
                        name: comm.clone(),
                        start_time_ns: event.timestamp_ns,
                        stop_time_ns: None,
                    });
            }
            EventKind::Exit { .. } => {
                if let Some(info) = self.hierarchy.processes.get_mut(&pid.0) {
                    info.stop_time_ns = Some(event.timestamp_ns);
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn hierarchy(&self) -> &ProcessHierarchy {
        &self.hierarchy
    }

    #[must_use]
    pub fn into_hierarchy(self) -> ProcessHierarchy {
        self.hierarchy
    }
}
