use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

/// Objects produced by the `memtrace-ebpf` package, one per bin target
const OBJECTS: &[&str] = &["exectrack", "memtrack"];

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the `exectrack` and `memtrack` eBPF objects
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Accepted for compatibility; objects are always built in release
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release: _ } => build_ebpf(&target)?,
    }

    Ok(())
}

fn build_ebpf(target: &str) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects; release
    // uses LTO to strip it.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("memtrace-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    let status = cmd.status().context("Failed to build eBPF objects")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF objects");
    }

    let out_dir = PathBuf::from("target").join(target).join("release");
    for object in OBJECTS {
        let path = out_dir.join(object);
        if !path.is_file() {
            anyhow::bail!("Build succeeded but {} is missing", path.display());
        }
        println!("✓ {}", path.display());
    }
    println!("  Target: {target}");
    println!("  Profile: release (always)");
    println!("  Pass --bpf-dir {} to memtrace if running from elsewhere", out_dir.display());

    Ok(())
}
