//! # memtrace - process-tree memory tracing with eBPF
//!
//! memtrace follows a root process and every descendant it forks, recording
//! their lifecycle and their allocator and memory-mapping activity into a
//! JSON artifact.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Traced process tree                         │
//! └───────────────┬───────────────────────────┬──────────────────┘
//!                 │ fork/exec/exit            │ malloc/free/mmap/brk
//!                 ▼                           ▼
//! ┌──────────────────────────┐  ┌─────────────────────────────────┐
//! │  exectrack (tracepoints) │  │  memtrack (uprobes, syscalls)   │
//! │  TRACKED_PIDS, EVENTS    │  │  TRACKED_PIDS, *_SIZES, EVENTS  │
//! └───────────────┬──────────┘  └────────────────┬────────────────┘
//!                 │ ProcessRecord                │ AllocRecord
//!                 ▼                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  memtrace (this crate): drain -> decode -> collect -> export │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`probes`]: loading, attaching and arming the kernel objects; draining
//!   their ring buffers
//! - [`session`]: one tracing run from attach to artifact
//! - [`events`]: decoded events and record decoding
//! - [`hierarchy`]: parent/child tree built from lifecycle events
//! - [`export`]: the JSON artifact
//! - [`libc_paths`]: which libc objects get allocator probes
//! - [`preflight`]: privilege, kernel and object checks
//! - [`sim`]: host engine running the kernel program bodies against
//!   in-memory tables, used to test tracking semantics without a kernel
//! - [`cli`]: command-line arguments
//! - [`domain`]: `Pid`, `Tid` and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! sudo ./target/release/memtrace track -o trace.json -- ./my-benchmark
//! sudo ./target/release/memtrace attach --pid 1234 --duration 30
//! ```

pub mod cli;
pub mod domain;
pub mod events;
pub mod export;
pub mod hierarchy;
pub mod libc_paths;
pub mod preflight;
pub mod probes;
pub mod session;
pub mod sim;
