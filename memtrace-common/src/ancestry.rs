//! Process ancestry tracking
//!
//! Two bounded maps describe the tracked forest:
//!
//! - tracked pids: presence marker, set when a root is armed or a tracked
//!   parent forks
//! - pid parents: one `child -> parent` link per propagated fork
//!
//! [`is_tracked`] walks the parent links at most [`ANCESTRY_DEPTH`] levels.
//! The verifier rejects unbounded loops, so a descendant further than that
//! below its nearest marked ancestor is reported as untracked.
//!
//! Map failures are absorbed. A full table simply means the child is not
//! followed.

/// Maximum parent links followed by [`is_tracked`]
pub const ANCESTRY_DEPTH: usize = 5;

/// Storage behind the ancestry walk
///
/// Each method is a single map operation. Nothing here is transactional: a
/// fork racing with its parent's exit may observe either state.
pub trait AncestryMaps {
    /// Whether `pid` carries a presence marker
    fn is_marked(&self, pid: u32) -> bool;

    /// Recorded parent of `pid`, if any
    fn parent_of(&self, pid: u32) -> Option<u32>;

    /// Set the presence marker. Returns `false` when the table is full.
    fn mark(&self, pid: u32) -> bool;

    /// Record `child -> parent`. Returns `false` when the table is full.
    fn link(&self, child: u32, parent: u32) -> bool;

    /// Drop both the marker and the parent link of `pid`
    fn forget(&self, pid: u32);
}

/// Whether `pid` or one of its first [`ANCESTRY_DEPTH`] ancestors is marked
#[inline(always)]
pub fn is_tracked<M: AncestryMaps + ?Sized>(maps: &M, pid: u32) -> bool {
    if maps.is_marked(pid) {
        return true;
    }

    let mut current = pid;
    for _ in 0..ANCESTRY_DEPTH {
        let Some(parent) = maps.parent_of(current) else {
            return false;
        };
        if maps.is_marked(parent) {
            return true;
        }
        current = parent;
    }

    false
}

/// Propagate tracking from `parent_pid` to `child_pid`
///
/// Returns `true` when the parent was tracked. The child is then marked and
/// linked even if one of the inserts hit a full table.
#[inline(always)]
pub fn handle_fork<M: AncestryMaps + ?Sized>(maps: &M, parent_pid: u32, child_pid: u32) -> bool {
    if !is_tracked(maps, parent_pid) {
        return false;
    }

    let _ = maps.mark(child_pid);
    let _ = maps.link(child_pid, parent_pid);
    true
}

/// Remove `pid` from both tables. Idempotent; children keep their links.
#[inline(always)]
pub fn handle_exit<M: AncestryMaps + ?Sized>(maps: &M, pid: u32) {
    maps.forget(pid);
}

/// Mark `pid` as a root without a parent link
///
/// Returns `false` when the tracked table is full.
#[inline(always)]
pub fn arm<M: AncestryMaps + ?Sized>(maps: &M, pid: u32) -> bool {
    maps.mark(pid)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::AncestryMaps;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Unbounded single-threaded maps for exercising the walk
    #[derive(Default)]
    pub struct TestAncestry {
        pub tracked: RefCell<HashMap<u32, u8>>,
        pub parents: RefCell<HashMap<u32, u32>>,
        pub capacity: Option<usize>,
    }

    impl TestAncestry {
        fn has_room<V>(&self, map: &HashMap<u32, V>, key: u32) -> bool {
            self.capacity.map_or(true, |cap| map.contains_key(&key) || map.len() < cap)
        }
    }

    impl AncestryMaps for TestAncestry {
        fn is_marked(&self, pid: u32) -> bool {
            self.tracked.borrow().contains_key(&pid)
        }

        fn parent_of(&self, pid: u32) -> Option<u32> {
            self.parents.borrow().get(&pid).copied()
        }

        fn mark(&self, pid: u32) -> bool {
            let mut tracked = self.tracked.borrow_mut();
            if !self.has_room(&tracked, pid) {
                return false;
            }
            tracked.insert(pid, 1);
            true
        }

        fn link(&self, child: u32, parent: u32) -> bool {
            let mut parents = self.parents.borrow_mut();
            if !self.has_room(&parents, child) {
                return false;
            }
            parents.insert(child, parent);
            true
        }

        fn forget(&self, pid: u32) {
            self.tracked.borrow_mut().remove(&pid);
            self.parents.borrow_mut().remove(&pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestAncestry;
    use super::*;

    /// Root 100 marked, 101..=100+depth linked as a straight chain with no markers
    fn unmarked_chain(depth: u32) -> TestAncestry {
        let maps = TestAncestry::default();
        arm(&maps, 100);
        for pid in 101..=100 + depth {
            maps.link(pid, pid - 1);
        }
        maps
    }

    #[test]
    fn test_walk_bound() {
        let maps = unmarked_chain(6);
        assert!(is_tracked(&maps, 105), "depth 5 must be found");
        assert!(!is_tracked(&maps, 106), "depth 6 is past the bound");
    }

    #[test]
    fn test_fork_propagates_only_from_tracked_parent() {
        let maps = TestAncestry::default();
        arm(&maps, 1);

        assert!(handle_fork(&maps, 1, 2));
        assert!(is_tracked(&maps, 2));
        assert_eq!(maps.parent_of(2), Some(1));

        assert!(!handle_fork(&maps, 50, 51));
        assert!(!is_tracked(&maps, 51));
        assert_eq!(maps.parent_of(51), None);
    }

    #[test]
    fn test_propagated_descendants_are_marked() {
        let maps = TestAncestry::default();
        arm(&maps, 1);
        for pid in 2..20 {
            assert!(handle_fork(&maps, pid - 1, pid));
        }
        // every generation carries its own marker, so depth is irrelevant
        assert!(is_tracked(&maps, 19));
    }

    #[test]
    fn test_exit_is_idempotent() {
        let maps = TestAncestry::default();
        arm(&maps, 1);
        handle_fork(&maps, 1, 2);

        handle_exit(&maps, 2);
        assert!(!is_tracked(&maps, 2));
        assert_eq!(maps.parent_of(2), None);
        handle_exit(&maps, 2);
        assert!(!is_tracked(&maps, 2));
        assert!(is_tracked(&maps, 1));
    }

    #[test]
    fn test_children_not_reparented() {
        let maps = unmarked_chain(2);
        handle_exit(&maps, 101);
        // 102 still points at the departed 101, which has no link of its own
        assert_eq!(maps.parent_of(102), Some(101));
        assert!(!is_tracked(&maps, 102));
    }

    #[test]
    fn test_full_table_absorbed() {
        let maps = TestAncestry { capacity: Some(1), ..TestAncestry::default() };
        assert!(arm(&maps, 1));
        assert!(handle_fork(&maps, 1, 2), "parent is tracked even if the child insert fails");
        assert!(!maps.is_marked(2));
        // an existing key can still be updated
        assert!(maps.mark(1));
    }
}
