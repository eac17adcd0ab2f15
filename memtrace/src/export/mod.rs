//! Trace artifact export
//!
//! The artifact is a single JSON document:
//!
//! ```json
//! { "root_pid": 1234, "events": [ ... ], "hierarchy": { ... } }
//! ```
//!
//! Events from both channels are merged and sorted on `timestamp_ns`, since
//! per-CPU commit order is not a global order. The collector keeps at most
//! one batch in memory; full batches are sorted and spilled to temporary
//! files, and the runs are merged while the artifact is streamed out. The
//! hierarchy is rebuilt from the sorted lifecycle events.

mod spill;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::domain::{ExportError, Pid};
use crate::events::TraceEvent;
use crate::hierarchy::{HierarchyBuilder, ProcessHierarchy};
use spill::{merge_sorted, EventSource, SpillRun};

/// Events held in memory before a batch is spilled
pub const DEFAULT_SPILL_THRESHOLD: usize = 100_000;

/// A written artifact, read back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceArtifact {
    pub root_pid: Pid,
    pub events: Vec<TraceEvent>,
    pub hierarchy: ProcessHierarchy,
}

impl TraceArtifact {
    /// # Errors
    /// Returns an error if the input is not a valid artifact
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ExportError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// What ended up in a written artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub events: u64,
    pub processes: usize,
}

/// Accumulates decoded events until the session ends
#[derive(Debug)]
pub struct ArtifactCollector {
    root_pid: Pid,
    batch: Vec<TraceEvent>,
    runs: Vec<SpillRun>,
    /// Lifecycle events are few; they stay in memory for the hierarchy
    lifecycle: Vec<TraceEvent>,
    spill_threshold: usize,
    total: usize,
}

impl ArtifactCollector {
    #[must_use]
    pub fn new(root_pid: Pid) -> Self {
        Self::with_spill_threshold(root_pid, DEFAULT_SPILL_THRESHOLD)
    }

    #[must_use]
    pub fn with_spill_threshold(root_pid: Pid, spill_threshold: usize) -> Self {
        Self {
            root_pid,
            batch: Vec::new(),
            runs: Vec::new(),
            lifecycle: Vec::new(),
            spill_threshold: spill_threshold.max(1),
            total: 0,
        }
    }

    pub fn push(&mut self, event: TraceEvent) {
        if event.kind.is_lifecycle() {
            self.lifecycle.push(event.clone());
        }
        self.batch.push(event);
        self.total += 1;
        if self.batch.len() >= self.spill_threshold {
            self.spill();
        }
    }

    fn spill(&mut self) {
        // stable, so same-timestamp events keep their drain order
        self.batch.sort_by_key(|e| e.timestamp_ns);
        match SpillRun::write(&self.batch) {
            Ok(run) => {
                debug!("Spilled {} events (run {})", self.batch.len(), self.runs.len());
                self.runs.push(run);
                self.batch.clear();
            }
            Err(e) => {
                warn!("Failed to spill events, keeping the rest in memory: {e}");
                self.spill_threshold = usize::MAX;
            }
        }
    }

    /// Events pushed so far, spilled or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Sort the lifecycle events and derive the process tree
    #[must_use]
    pub fn hierarchy(&self) -> ProcessHierarchy {
        let mut lifecycle: Vec<&TraceEvent> = self.lifecycle.iter().collect();
        lifecycle.sort_by_key(|e| e.timestamp_ns);

        let mut builder = HierarchyBuilder::new(self.root_pid);
        for event in lifecycle {
            builder.process_event(event);
        }
        builder.into_hierarchy()
    }

    /// Stream the artifact, merging spilled runs with the in-memory batch
    ///
    /// # Errors
    /// Returns an error if a run cannot be read back or the write fails
    pub fn write_to<W: Write>(mut self, mut writer: W) -> Result<ArtifactSummary, ExportError> {
        let hierarchy = self.hierarchy();
        self.batch.sort_by_key(|e| e.timestamp_ns);

        // runs in spill order, then the tail: ties resolve in push order
        let mut sources: Vec<EventSource<'_>> =
            self.runs.into_iter().map(SpillRun::into_source).collect();
        sources.push(Box::new(self.batch.into_iter().map(Ok::<_, ExportError>)));

        writer.write_all(b"{\"root_pid\":")?;
        serde_json::to_writer(&mut writer, &self.root_pid)?;
        writer.write_all(b",\"events\":[")?;
        let mut first = true;
        let events = merge_sorted(sources, |event| {
            if !first {
                writer.write_all(b",")?;
            }
            first = false;
            serde_json::to_writer(&mut writer, event)?;
            Ok(())
        })?;
        writer.write_all(b"],\"hierarchy\":")?;
        serde_json::to_writer(&mut writer, &hierarchy)?;
        writer.write_all(b"}")?;

        Ok(ArtifactSummary { events, processes: hierarchy.processes.len() })
    }

    /// # Errors
    /// Returns an error if the file cannot be created or written
    pub fn write_to_path(self, path: &Path) -> Result<ArtifactSummary, ExportError> {
        let file = File::create(path)
            .map_err(|e| ExportError::WriteFailed(format!("{}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        let summary = self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tid;
    use crate::events::EventKind;

    fn written(collector: ArtifactCollector) -> (TraceArtifact, ArtifactSummary) {
        let mut out = Vec::new();
        let summary = collector.write_to(&mut out).unwrap();
        (TraceArtifact::from_reader(out.as_slice()).unwrap(), summary)
    }

    #[test]
    fn test_write_sorts_across_channels() {
        let mut collector = ArtifactCollector::new(Pid(1));
        collector.push(TraceEvent {
            timestamp_ns: 30,
            pid: Pid(2),
            tid: Tid(2),
            kind: EventKind::Free { addr: 0x10 },
        });
        collector.push(TraceEvent {
            timestamp_ns: 10,
            pid: Pid(2),
            tid: Tid(1),
            kind: EventKind::Fork { ppid: Pid(1), comm: "sh".into() },
        });
        collector.push(TraceEvent {
            timestamp_ns: 20,
            pid: Pid(2),
            tid: Tid(2),
            kind: EventKind::Malloc { addr: 0x10, size: 8 },
        });

        let (artifact, summary) = written(collector);
        let stamps: Vec<_> = artifact.events.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
        assert_eq!(artifact.root_pid, Pid(1));
        assert_eq!(artifact.hierarchy.children[&1], vec![Pid(2)]);
        assert_eq!(summary, ArtifactSummary { events: 3, processes: 1 });
    }

    #[test]
    fn test_spilled_runs_merge_into_one_timeline() {
        let mut collector = ArtifactCollector::with_spill_threshold(Pid(1), 4);
        // interleaved stamps so every run overlaps the others and the tail
        let stamps = [50u64, 10, 40, 20, 45, 15, 35, 25, 30, 5, 40];
        for (i, &timestamp_ns) in stamps.iter().enumerate() {
            collector.push(TraceEvent {
                timestamp_ns,
                pid: Pid(2),
                tid: Tid(2),
                kind: EventKind::Malloc { addr: i as u64, size: 8 },
            });
        }
        assert_eq!(collector.runs.len(), 2);
        assert_eq!(collector.batch.len(), 3);
        assert_eq!(collector.len(), stamps.len());

        let (artifact, summary) = written(collector);
        let got: Vec<_> = artifact.events.iter().map(|e| e.timestamp_ns).collect();
        let mut expected = stamps.to_vec();
        expected.sort_unstable();
        assert_eq!(got, expected);
        assert_eq!(summary.events, stamps.len() as u64);

        // the two 40s were pushed as addr 2 (first run) then addr 10 (tail)
        let tied: Vec<_> = artifact
            .events
            .iter()
            .filter(|e| e.timestamp_ns == 40)
            .map(|e| match e.kind {
                EventKind::Malloc { addr, .. } => addr,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tied, vec![2, 10]);
    }

    #[test]
    fn test_lifecycle_survives_spill() {
        let mut collector = ArtifactCollector::with_spill_threshold(Pid(1), 1);
        collector.push(TraceEvent {
            timestamp_ns: 10,
            pid: Pid(2),
            tid: Tid(2),
            kind: EventKind::Fork { ppid: Pid(1), comm: "sh".into() },
        });
        collector.push(TraceEvent {
            timestamp_ns: 20,
            pid: Pid(2),
            tid: Tid(2),
            kind: EventKind::Exit { comm: "sh".into() },
        });
        assert!(collector.batch.is_empty());

        let (artifact, _) = written(collector);
        assert_eq!(artifact.events.len(), 2);
        assert_eq!(artifact.hierarchy.processes[&2].stop_time_ns, Some(20));
    }
}
