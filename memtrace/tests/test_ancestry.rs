//! Tracking propagation through fork chains, driven through the engine

use memtrace::sim::{Engine, EngineConfig, Thread};

/// Root 100 forks 101, 101 forks 102, ... returns the deepest pid
fn fork_chain(engine: &Engine, root: u32, depth: u32) -> u32 {
    let mut pid = root;
    for _ in 0..depth {
        let child = pid + 1;
        engine.fork(Thread::main(pid), child);
        pid = child;
    }
    pid
}

#[test]
fn test_fork_of_tracked_parent_propagates() {
    let engine = Engine::default();
    assert!(engine.arm(100));

    assert!(engine.fork(Thread::main(100), 200));
    assert!(engine.is_tracked(200));
    assert!(engine.is_tracked_for_alloc(200));

    let records = engine.drain_process();
    assert_eq!(records.len(), 1);
    assert_eq!((records[0].pid, records[0].ppid), (200, 100));
}

#[test]
fn test_fork_of_untracked_parent_is_ignored() {
    let engine = Engine::default();
    engine.arm(100);

    assert!(!engine.fork(Thread::main(300), 301));
    assert!(!engine.is_tracked(301));
    assert!(engine.drain_process().is_empty());
}

#[test]
fn test_grandchildren_are_tracked() {
    let engine = Engine::default();
    engine.arm(100);

    let deepest = fork_chain(&engine, 100, 8);
    // every hop copies the mark, so depth is only bounded for unmarked links
    assert!(engine.is_tracked(deepest));
    assert_eq!(engine.drain_process().len(), 8);
}

#[test]
fn test_exit_untracks_and_is_idempotent() {
    let engine = Engine::default();
    engine.arm(100);
    engine.fork(Thread::main(100), 101);
    engine.drain_process();

    assert!(engine.exit(Thread::main(101)));
    assert!(!engine.is_tracked(101));
    assert!(!engine.exit(Thread::main(101)));
    assert_eq!(engine.drain_process().len(), 1);
}

#[test]
fn test_exit_does_not_reparent_children() {
    let engine = Engine::default();
    engine.arm(100);
    engine.fork(Thread::main(100), 101);
    engine.fork(Thread::main(101), 102);

    engine.exit(Thread::main(101));
    assert!(engine.is_tracked(102));
    assert!(engine.fork(Thread::main(102), 103));
}

#[test]
fn test_disarm_root_keeps_descendants() {
    let engine = Engine::default();
    engine.arm(100);
    engine.fork(Thread::main(100), 101);

    engine.disarm(100);
    assert!(!engine.is_tracked(100));
    assert!(engine.is_tracked(101));
}

#[test]
fn test_full_tracked_table_falls_back_to_links() {
    let engine = Engine::new(EngineConfig { max_entries: 3, ..EngineConfig::default() });
    engine.arm(1);
    engine.fork(Thread::main(1), 2);
    engine.fork(Thread::main(1), 3);

    // no room for a marker, the parent link still carries tracking
    assert!(engine.fork(Thread::main(1), 4));
    assert!(engine.is_tracked(4));

    // both tables full: the fork is reported but the child is lost
    assert!(engine.fork(Thread::main(1), 5));
    assert!(!engine.is_tracked(5));
    assert_eq!(engine.drain_process().len(), 4);
}

#[test]
fn test_walk_stops_after_five_links() {
    let engine = Engine::new(EngineConfig { max_entries: 8, ..EngineConfig::default() });
    // fill the marker table so descendants are only linked
    for pid in [100, 1, 2, 3, 4, 5, 6, 7] {
        assert!(engine.arm(pid));
    }
    assert!(!engine.arm(8));

    let depth_five = fork_chain(&engine, 100, 5);
    assert!(engine.is_tracked(depth_five));

    let depth_six = depth_five + 1;
    engine.fork(Thread::main(depth_five), depth_six);
    assert!(!engine.is_tracked(depth_six));
}
