//! A tracing session: loaded objects, their ring buffers and the artifact
//! being collected
//!
//! Objects are loaded and attached before the root process is known so that
//! `track` can arm a freshly spawned child before it does anything.

use anyhow::{Context, Result};
use std::path::Path;
use log::{info, warn};

use crate::cli::TraceOptions;
use crate::domain::Pid;
use crate::export::{ArtifactCollector, ArtifactSummary};
use crate::libc_paths::find_libc_paths;
use crate::preflight::run_preflight_checks;
use crate::probes::{bump_memlock_rlimit, ExecTracker, MemTracker, ProcessTracking, RingDrain};

/// Attached objects waiting for a root process
pub struct Tracers {
    exec: ExecTracker,
    mem: Option<MemTracker>,
    process_drain: RingDrain,
    alloc_drain: Option<RingDrain>,
}

impl Tracers {
    /// Run preflight checks, then load and attach both objects
    ///
    /// # Errors
    /// Returns an error if a check fails or an object cannot be loaded
    pub fn load(options: &TraceOptions) -> Result<Self> {
        let with_alloc = !options.no_alloc;
        run_preflight_checks(&options.bpf_dir, with_alloc)?;
        bump_memlock_rlimit()?;

        let mut exec = ExecTracker::load(&options.bpf_dir)?;
        let process_drain = RingDrain::process(exec.take_events()?)
            .context("Failed to register the process ring")?;

        let (mem, alloc_drain) = if with_alloc {
            let libc_paths = find_libc_paths()?;
            let mut mem = MemTracker::load(&options.bpf_dir, &libc_paths)?;
            if options.start_disabled {
                mem.set_tracking_enabled(false)?;
            }
            let drain = RingDrain::alloc(mem.take_events()?)
                .context("Failed to register the alloc ring")?;
            (Some(mem), Some(drain))
        } else {
            (None, None)
        };

        Ok(Self { exec, mem, process_drain, alloc_drain })
    }

    /// Arm `root` in every loaded object and start collecting
    ///
    /// # Errors
    /// Returns an error if the pid cannot be written to a tracked-set map
    pub fn track(mut self, root: Pid) -> Result<Session> {
        self.exec.arm(root)?;
        if let Some(mem) = self.mem.as_mut() {
            mem.arm(root)?;
        }
        info!("Tracking {root}");
        Ok(Session { tracers: self, root, collector: ArtifactCollector::new(root) })
    }
}

/// Counters reported when a session ends
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionSummary {
    pub process_records: u64,
    pub alloc_records: u64,
    pub rejected: u64,
}

pub struct Session {
    tracers: Tracers,
    root: Pid,
    collector: ArtifactCollector,
}

impl Session {
    #[must_use]
    pub fn root(&self) -> Pid {
        self.root
    }

    /// Drain everything currently committed on both channels
    pub fn poll(&mut self) -> u64 {
        let mut read = self.tracers.process_drain.drain_into(&mut self.collector);
        if let Some(drain) = self.tracers.alloc_drain.as_mut() {
            read += drain.drain_into(&mut self.collector);
        }
        read
    }

    /// Wait until either ring has committed records, then drain both
    ///
    /// # Errors
    /// Returns an error if readiness cannot be polled on a ring
    pub async fn drain_ready(&mut self) -> Result<u64> {
        let tracers = &mut self.tracers;
        let ready = match tracers.alloc_drain.as_mut() {
            Some(alloc) => {
                tokio::select! {
                    ready = tracers.process_drain.ready() => ready,
                    ready = alloc.ready() => ready,
                }
            }
            None => tracers.process_drain.ready().await,
        };
        ready.context("Failed to poll ring readiness")?;
        Ok(self.poll())
    }

    /// Switch allocation reporting; a no-op when allocator probes are off
    pub fn set_tracking_enabled(&mut self, enabled: bool) {
        let Some(mem) = self.tracers.mem.as_mut() else {
            warn!("Allocation tracking is not loaded (--no-alloc)");
            return;
        };
        if let Err(e) = mem.set_tracking_enabled(enabled) {
            warn!("Failed to toggle allocation tracking: {e:#}");
        }
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let process = self.tracers.process_drain.stats();
        let alloc = self.tracers.alloc_drain.as_ref().map(RingDrain::stats).unwrap_or_default();
        SessionSummary {
            process_records: process.decoded,
            alloc_records: alloc.decoded,
            rejected: process.rejected + alloc.rejected,
        }
    }

    /// Final drain, then disarm the root and write the artifact to `path`
    ///
    /// # Errors
    /// Returns an error if the artifact cannot be written
    pub fn finish(mut self, path: &Path) -> Result<(ArtifactSummary, SessionSummary)> {
        self.poll();
        let root = self.root;
        if let Err(e) = self.tracers.exec.disarm(root) {
            warn!("Failed to disarm {root}: {e:#}");
        }
        if let Some(mem) = self.tracers.mem.as_mut() {
            if let Err(e) = mem.disarm(root) {
                warn!("Failed to disarm {root}: {e:#}");
            }
        }
        let summary = self.summary();
        let artifact = self
            .collector
            .write_to_path(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok((artifact, summary))
    }
}
