//! Host reference engine
//!
//! Runs the shared hook bodies from `memtrace-common` against in-process
//! stand-ins for the kernel maps and ring buffers:
//!
//! - [`BoundedMap`] - fixed-capacity table, single-key atomic operations
//! - [`EventRing`] - bounded non-blocking channel sized from the ring buffer budget
//! - [`Engine`] - one instance of both eBPF objects, one method per hook
//!
//! Used to exercise tracking and correlation behavior without a kernel.

pub mod engine;
pub mod maps;
pub mod ring;

pub use engine::{Engine, EngineConfig, MonotonicClock, Thread};
pub use maps::{BoundedMap, HostAncestry};
pub use ring::{slots_for, EventRing};
