//! Loading and attachment of the `exectrack` and `memtrack` objects
//!
//! Objects are read from a build directory at runtime rather than embedded,
//! so the userspace crate builds without the BPF toolchain.

use anyhow::{Context, Result};
use aya::{
    maps::{HashMap, MapData, RingBuf},
    programs::{TracePoint, UProbe},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use memtrace_common::TRACKING_ENABLED_KEY;
use std::path::{Path, PathBuf};

use super::{ProcessTracking, EXECTRACK_OBJECT, EXEC_TRACEPOINTS, LIBC_PROBES, MEMTRACK_OBJECT, MEM_TRACEPOINTS};
use crate::domain::{Pid, TracerError};

fn load_object(bpf_dir: &Path, name: &str) -> Result<Ebpf, TracerError> {
    let path = bpf_dir.join(name);
    if !path.is_file() {
        return Err(TracerError::ObjectNotFound(path));
    }
    let bpf = Ebpf::load_file(&path)
        .map_err(|e| TracerError::LoadFailed { object: name.to_string(), error: e.to_string() })?;
    debug!("Loaded eBPF object {}", path.display());
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        // objects without log statements have no AYA_LOGS map
        debug!("eBPF logger not initialized: {e}");
    }
}

fn attach_tracepoints(bpf: &mut Ebpf, points: &[(&str, &str, &str)]) -> Result<()> {
    for &(program_name, category, event) in points {
        let program: &mut TracePoint = bpf
            .program_mut(program_name)
            .with_context(|| format!("{program_name} program not found"))?
            .try_into()?;
        program.load()?;
        program.attach(category, event).map_err(|e| TracerError::ProbeAttachFailed {
            probe: program_name.to_string(),
            target: format!("{category}/{event}"),
            error: e.to_string(),
        })?;
        info!("✓ Attached tracepoint: {category}/{event}");
    }
    Ok(())
}

fn uprobe_mut<'a>(bpf: &'a mut Ebpf, program_name: &str) -> Result<&'a mut UProbe> {
    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("{program_name} program not found"))?
        .try_into()?;
    Ok(program)
}

fn attach_uprobe(bpf: &mut Ebpf, program_name: &str, symbol: &str, target: &Path) -> Result<()> {
    uprobe_mut(bpf, program_name)?.attach(Some(symbol), 0, target, None).map_err(|e| {
        TracerError::ProbeAttachFailed {
            probe: program_name.to_string(),
            target: format!("{}:{symbol}", target.display()),
            error: e.to_string(),
        }
    })?;
    Ok(())
}

fn tracked_pids_map(bpf: &mut Ebpf) -> Result<HashMap<&mut MapData, u32, u8>> {
    let map = bpf.map_mut("TRACKED_PIDS").ok_or(TracerError::MapAccess {
        map: "TRACKED_PIDS",
        error: "not found in object".to_string(),
    })?;
    Ok(HashMap::try_from(map)?)
}

fn arm_pid(bpf: &mut Ebpf, pid: Pid) -> Result<()> {
    tracked_pids_map(bpf)?
        .insert(pid.0, 1, 0)
        .with_context(|| format!("Failed to add {pid} to the tracked set"))
}

fn disarm_pid(bpf: &mut Ebpf, pid: Pid) -> Result<()> {
    {
        let mut tracked = tracked_pids_map(bpf)?;
        if let Err(e) = tracked.remove(&pid.0) {
            debug!("{pid} was not armed: {e}");
        }
    }
    let mut parents: HashMap<_, u32, u32> = HashMap::try_from(
        bpf.map_mut("PID_PARENTS").context("PID_PARENTS map not found")?,
    )?;
    let _ = parents.remove(&pid.0);
    Ok(())
}

fn take_events(bpf: &mut Ebpf) -> Result<RingBuf<MapData>> {
    let map = bpf.take_map("EVENTS").ok_or(TracerError::MapAccess {
        map: "EVENTS",
        error: "not found in object (already taken?)".to_string(),
    })?;
    Ok(RingBuf::try_from(map)?)
}

/// Process lifecycle tracking (`exectrack`)
pub struct ExecTracker {
    bpf: Ebpf,
}

impl ExecTracker {
    /// Load the object and attach its scheduler tracepoints
    ///
    /// # Errors
    /// Returns an error if the object is missing or a tracepoint cannot attach
    pub fn load(bpf_dir: &Path) -> Result<Self> {
        let mut bpf = load_object(bpf_dir, EXECTRACK_OBJECT)?;
        init_ebpf_logger(&mut bpf);
        attach_tracepoints(&mut bpf, EXEC_TRACEPOINTS)?;
        Ok(Self { bpf })
    }

    /// Take the lifecycle ring buffer; may only be called once
    ///
    /// # Errors
    /// Returns an error if the map was already taken
    pub fn take_events(&mut self) -> Result<RingBuf<MapData>> {
        take_events(&mut self.bpf)
    }
}

impl ProcessTracking for ExecTracker {
    fn arm(&mut self, pid: Pid) -> Result<()> {
        arm_pid(&mut self.bpf, pid)
    }

    fn disarm(&mut self, pid: Pid) -> Result<()> {
        disarm_pid(&mut self.bpf, pid)
    }
}

/// Allocation and mapping tracking (`memtrack`)
pub struct MemTracker {
    bpf: Ebpf,
}

impl MemTracker {
    /// Load the object, attach syscall tracepoints and probe every libc
    ///
    /// # Errors
    /// Returns an error if the object is missing, a tracepoint cannot attach,
    /// or `malloc`/`free` cannot be probed in any of `libc_paths`
    pub fn load(bpf_dir: &Path, libc_paths: &[PathBuf]) -> Result<Self> {
        let mut bpf = load_object(bpf_dir, MEMTRACK_OBJECT)?;
        init_ebpf_logger(&mut bpf);
        attach_tracepoints(&mut bpf, MEM_TRACEPOINTS)?;

        for probe in LIBC_PROBES {
            for program in std::iter::once(probe.entry).chain(probe.ret) {
                uprobe_mut(&mut bpf, program)?.load()?;
            }
        }

        for libc in libc_paths {
            for probe in LIBC_PROBES {
                for program in std::iter::once(probe.entry).chain(probe.ret) {
                    match attach_uprobe(&mut bpf, program, probe.symbol, libc) {
                        Ok(()) => debug!("Attached {program} to {}", libc.display()),
                        Err(e) if probe.required => return Err(e),
                        Err(e) => warn!("Skipping optional probe: {e}"),
                    }
                }
            }
            info!("✓ Attached allocator probes: {}", libc.display());
        }

        Ok(Self { bpf })
    }

    /// Switch allocation reporting on or off
    ///
    /// Correlation state keeps being maintained while off, so a call that
    /// started while disabled is still reported if it returns after enabling.
    ///
    /// # Errors
    /// Returns an error if the map is unavailable
    pub fn set_tracking_enabled(&mut self, enabled: bool) -> Result<()> {
        let mut flag: HashMap<_, u32, u8> = HashMap::try_from(
            self.bpf.map_mut("TRACKING_ENABLED").context("TRACKING_ENABLED map not found")?,
        )?;
        flag.insert(TRACKING_ENABLED_KEY, u8::from(enabled), 0)?;
        info!("Allocation tracking {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Take the allocation ring buffer; may only be called once
    ///
    /// # Errors
    /// Returns an error if the map was already taken
    pub fn take_events(&mut self) -> Result<RingBuf<MapData>> {
        take_events(&mut self.bpf)
    }
}

impl ProcessTracking for MemTracker {
    fn arm(&mut self, pid: Pid) -> Result<()> {
        arm_pid(&mut self.bpf, pid)
    }

    fn disarm(&mut self, pid: Pid) -> Result<()> {
        disarm_pid(&mut self.bpf, pid)
    }
}
