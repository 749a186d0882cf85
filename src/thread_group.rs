//! Tracks a group of tracees descended from one `fork()`, keyed by
//! logical tid rather than OS pid so record and replay agree even when
//! the underlying OS pids differ (spec.md §3: "a stable logical tid
//! assigned by the core").
//!
//! Adapted from the teacher's `ThreadGroup`: the `Rc<RefCell<_>>` /
//! `Weak` session-pointer plumbing was there to let a `ThreadGroup` be
//! shared between a `Task` and its owning `Session` in rr/rd's wider
//! object graph (checkpoints, address-space sharing). This core's
//! session owns thread groups outright, so a plain `HashSet` keyed by
//! logical tid is enough.

use std::collections::HashSet;

pub struct ThreadGroup {
    pub leader_tid: u32,
    members: HashSet<u32>,
    /// Set when the group is undergoing mass exit (e.g. `exit_group()`):
    /// the scheduler should stop trying to serialize further execution of
    /// its members and just drain their terminations.
    pub destabilized: bool,
}

impl ThreadGroup {
    pub fn new(leader_tid: u32) -> ThreadGroup {
        log!(LogDebug, "creating thread group led by tid {}", leader_tid);
        let mut members = HashSet::new();
        members.insert(leader_tid);
        ThreadGroup {
            leader_tid,
            members,
            destabilized: false,
        }
    }

    pub fn add_member(&mut self, tid: u32) {
        self.members.insert(tid);
    }

    pub fn remove_member(&mut self, tid: u32) {
        self.members.remove(&tid);
    }

    pub fn members(&self) -> impl Iterator<Item = &u32> {
        self.members.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Marks every member destabilized. Needed for the same reason the
    /// teacher documents at length: once one member of a group is seen
    /// exiting via `PTRACE_EVENT_EXIT`, the kernel may reap the rest in an
    /// order the supervisor can't predict, so blocking on a specific
    /// member's wait() can deadlock. Destabilizing hands scheduling of the
    /// group's remaining termination back to the kernel.
    pub fn destabilize(&mut self) {
        log!(LogDebug, "destabilizing thread group led by tid {}", self.leader_tid);
        self.destabilized = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_group_contains_its_leader() {
        let tg = ThreadGroup::new(7);
        assert!(tg.members().any(|&t| t == 7));
    }

    #[test]
    fn removing_all_members_empties_the_group() {
        let mut tg = ThreadGroup::new(7);
        tg.add_member(8);
        tg.remove_member(7);
        tg.remove_member(8);
        assert!(tg.is_empty());
    }
}
