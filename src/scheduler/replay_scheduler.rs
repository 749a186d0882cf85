//! Replay scheduler (spec.md §4.5): reproduces the exact logical-tid
//! sequence the record scheduler produced, by reading it back off the
//! trace rather than deciding anything itself.
//!
//! Grounded on the teacher's replay-side scheduling, which drives thread
//! selection from the recorded event stream instead of live runnability;
//! adapted here to read the SCHED ordering directly out of `EventRecord`s
//! rather than the teacher's wider `Session`/`Task` graph.

use crate::event::{EventPayload, EventRecord};

pub struct ReplaySchedule {
    order: Vec<u32>,
    cursor: usize,
}

impl ReplaySchedule {
    /// Builds the replay order from a trace's events, in the order they
    /// were written. Every event belongs to the tid that was running when
    /// it was recorded, so replaying events in file order reproduces the
    /// record scheduler's interleaving exactly (spec.md §4.5's core
    /// invariant). One schedule entry per event, `INIT` included, since the
    /// replayer dispatches every event (including `INIT`) one-for-one
    /// against `pick_next()`.
    pub fn from_events(events: &[EventRecord]) -> ReplaySchedule {
        let order = events.iter().map(|e| e.logical_tid).collect();
        ReplaySchedule { order, cursor: 0 }
    }
}

pub struct ReplayScheduler {
    schedule: ReplaySchedule,
}

impl ReplayScheduler {
    pub fn new(schedule: ReplaySchedule) -> ReplayScheduler {
        ReplayScheduler { schedule }
    }

    /// Returns the logical tid that should run next, or `None` once the
    /// trace is exhausted.
    pub fn pick_next(&mut self) -> Option<u32> {
        let tid = *self.schedule.order.get(self.schedule.cursor)?;
        self.schedule.cursor += 1;
        Some(tid)
    }

    pub fn remaining(&self) -> usize {
        self.schedule.order.len().saturating_sub(self.schedule.cursor)
    }

    pub fn is_exhausted(&self) -> bool {
        self.schedule.cursor >= self.schedule.order.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{EventPayload, ExitEvent, RegisterSnapshot};

    fn mk_event(tid: u32) -> EventRecord {
        EventRecord {
            seq: 0,
            logical_tid: tid,
            ticks_since_prev: 0,
            regs: RegisterSnapshot::default(),
            payload: EventPayload::Exit(ExitEvent { status: 0 }),
        }
    }

    #[test]
    fn pick_next_reproduces_file_order() {
        let events = vec![mk_event(1), mk_event(2), mk_event(1)];
        let mut sched = ReplayScheduler::new(ReplaySchedule::from_events(&events));
        assert_eq!(sched.pick_next(), Some(1));
        assert_eq!(sched.pick_next(), Some(2));
        assert_eq!(sched.pick_next(), Some(1));
        assert_eq!(sched.pick_next(), None);
        assert!(sched.is_exhausted());
    }
}
