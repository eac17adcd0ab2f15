//! # memtrace - Main Entry Point
//!
//! Two modes:
//! - **track** (`memtrace track -- CMD ...`): spawn a command and trace its tree
//! - **attach** (`memtrace attach --pid PID`): trace a running process
//!
//! Both write a JSON artifact when tracing stops.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use memtrace::cli::{Args, Command, TraceOptions};
use memtrace::domain::Pid;
use memtrace::preflight::check_process_exists;
use memtrace::session::{Session, Tracers};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

// /proc liveness check for attached processes
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("usage:") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Shell-style status: the exit code, or 128 + signal
fn status_code(status: ExitStatus) -> i32 {
    status.code().or_else(|| status.signal().map(|sig| 128 + sig)).unwrap_or(EXIT_ERROR)
}

#[tokio::main]
async fn run() -> Result<i32> {
    let args = Args::parse();
    let options = args.command.options().clone();

    if !options.quiet {
        println!("memtrace v{}", env!("CARGO_PKG_VERSION"));
    }

    match args.command {
        Command::Track { command, .. } => track(&options, &command).await,
        Command::Attach { pid, .. } => attach(&options, Pid(pid)).await,
    }
}

async fn track(options: &TraceOptions, command: &[String]) -> Result<i32> {
    let Some((program, program_args)) = command.split_first() else {
        anyhow::bail!("Missing command.\n\nUsage: memtrace track [OPTIONS] -- <COMMAND>...");
    };

    let tracers = Tracers::load(options)?;

    let mut child = tokio::process::Command::new(program)
        .args(program_args)
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    let pid = child.id().context("Child exited before it could be tracked")?;
    let mut session = tracers.track(Pid(pid))?;

    if !options.quiet {
        println!("command: {}", command.join(" "));
        println!("pid: {pid}");
    }

    let mut status = None;
    let exit_reason = {
        let child_exit = async {
            let result = child.wait().await;
            status = result.as_ref().ok().copied();
            result
        };
        drive(&mut session, options, child_exit).await?
    };

    if status.is_none() {
        // interrupted or out of time: stop the child before writing the artifact
        child.start_kill().ok();
        status = child.wait().await.ok();
    }

    finish(session, options, exit_reason)?;
    Ok(status.map_or(EXIT_ERROR, status_code))
}

async fn attach(options: &TraceOptions, pid: Pid) -> Result<i32> {
    check_process_exists(pid)?;
    let mut session = Tracers::load(options)?.track(pid)?;

    if !options.quiet {
        println!("pid: {}", pid.0);
    }

    let proc_path = format!("/proc/{}", pid.0);
    let process_gone = async {
        while Path::new(&proc_path).exists() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok::<_, std::io::Error>(ExitStatus::from_raw(0))
    };
    let exit_reason = drive(&mut session, options, process_gone).await?;

    finish(session, options, exit_reason)?;
    Ok(EXIT_SUCCESS)
}

/// Drain both channels as records arrive until the root is done, Ctrl+C
/// arrives or the duration runs out. SIGUSR1/SIGUSR2 toggle allocation
/// reporting in the meantime.
async fn drive<F>(session: &mut Session, options: &TraceOptions, root_done: F) -> Result<&'static str>
where
    F: std::future::Future<Output = std::io::Result<ExitStatus>>,
{
    let mut enable = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut disable = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::pin!(root_done);
    let time_limit = tokio::time::sleep(Duration::from_secs(options.duration));
    tokio::pin!(time_limit);

    // records committed before the rings were registered
    session.poll();

    let exit_reason = loop {
        tokio::select! {
            read = session.drain_ready() => {
                read?;
            }
            result = &mut root_done => {
                result.context("Failed to wait for the traced process")?;
                break "process exited";
            }
            () = &mut time_limit, if options.duration > 0 => break "duration limit reached",
            _ = &mut ctrl_c => break "interrupted",
            _ = enable.recv() => session.set_tracking_enabled(true),
            _ = disable.recv() => session.set_tracking_enabled(false),
        }
    };

    Ok(exit_reason)
}

fn finish(session: Session, options: &TraceOptions, exit_reason: &str) -> Result<()> {
    let root = session.root();
    info!("{exit_reason}, root {root}");
    let (artifact, summary) = session.finish(&options.output)?;

    if !options.quiet {
        eprintln!(
            "\n{exit_reason}: {} events (process: {}, alloc: {}, rejected: {}), {} processes",
            artifact.events,
            summary.process_records,
            summary.alloc_records,
            summary.rejected,
            artifact.processes,
        );
        println!("saved: {}", options.output.display());
    }
    Ok(())
}
