//! Pre-flight checks for memtrace
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::domain::Pid;
use crate::probes::{EXECTRACK_OBJECT, MEMTRACK_OBJECT};

/// BPF ring buffers landed in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failing check
pub fn run_preflight_checks(bpf_dir: &Path, with_alloc: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_bpf_objects(bpf_dir, with_alloc)?;
    Ok(())
}

fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: memtrace requires root privileges to load eBPF programs.\n\n\
         Run with: sudo memtrace ..."
    );
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             memtrace requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// `"5.15.0-generic"` -> `(5, 15)`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check that the compiled objects are where the loader will look
fn check_bpf_objects(bpf_dir: &Path, with_alloc: bool) -> Result<()> {
    let mut required = vec![EXECTRACK_OBJECT];
    if with_alloc {
        required.push(MEMTRACK_OBJECT);
    }

    for name in required {
        let path = bpf_dir.join(name);
        if !path.is_file() {
            bail!(
                "eBPF object not found: {}\n\n\
                 Build it with: cargo xtask build-ebpf --release\n\
                 or point --bpf-dir / MEMTRACE_BPF_DIR at the build output.",
                path.display()
            );
        }
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0
        );
    }
    Ok(())
}
