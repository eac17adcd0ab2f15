//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::probes::DEFAULT_BPF_DIR;

#[derive(Parser, Debug)]
#[command(
    name = "memtrace",
    version,
    about = "Trace process lineage and allocator activity of a process tree",
    after_help = "\
EXAMPLES:
    sudo memtrace track -- ./bench --iterations 10     Trace a command and its children
    sudo memtrace track -o trace.json -- make -j8      Write the artifact to trace.json
    sudo memtrace attach --pid 1234 --duration 30      Trace a running process for 30s

While tracing, SIGUSR1 enables and SIGUSR2 disables allocation reporting."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn a command and trace it and every descendant
    Track {
        #[command(flatten)]
        options: TraceOptions,

        /// Command to run, with its arguments
        #[arg(
            value_name = "COMMAND",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        command: Vec<String>,
    },

    /// Trace an already running process until it exits
    Attach {
        /// Process ID to trace
        #[arg(short, long)]
        pid: u32,

        #[command(flatten)]
        options: TraceOptions,
    },
}

impl Command {
    #[must_use]
    pub fn options(&self) -> &TraceOptions {
        match self {
            Self::Track { options, .. } | Self::Attach { options, .. } => options,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct TraceOptions {
    /// Write the JSON artifact to FILE
    #[arg(short, long, value_name = "FILE", default_value = "memtrace.json")]
    pub output: PathBuf,

    /// Directory holding the compiled `exectrack` and `memtrack` objects
    #[arg(long, value_name = "DIR", env = "MEMTRACE_BPF_DIR", default_value = DEFAULT_BPF_DIR)]
    pub bpf_dir: PathBuf,

    /// Only trace process lifecycle, skip allocator probes
    #[arg(long)]
    pub no_alloc: bool,

    /// Start with allocation reporting off (toggle with SIGUSR1)
    #[arg(long, conflicts_with = "no_alloc")]
    pub start_disabled: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_keeps_child_flags() {
        let args = Args::try_parse_from(["memtrace", "track", "--no-alloc", "--", "ls", "-la", "/tmp"])
            .unwrap();
        let Command::Track { options, command } = args.command else {
            panic!("expected track");
        };
        assert!(options.no_alloc);
        assert_eq!(command, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn test_track_requires_command() {
        assert!(Args::try_parse_from(["memtrace", "track"]).is_err());
    }

    #[test]
    fn test_attach_defaults() {
        let args = Args::try_parse_from(["memtrace", "attach", "--pid", "42"]).unwrap();
        let Command::Attach { pid, options } = args.command else {
            panic!("expected attach");
        };
        assert_eq!(pid, 42);
        assert_eq!(options.output, PathBuf::from("memtrace.json"));
        assert_eq!(options.duration, 0);
        assert!(!options.start_disabled);
    }

    #[test]
    fn test_start_disabled_conflicts_with_no_alloc() {
        let result = Args::try_parse_from([
            "memtrace",
            "attach",
            "--pid",
            "1",
            "--no-alloc",
            "--start-disabled",
        ]);
        assert!(result.is_err());
    }
}
