use std::sync::{Condvar, Mutex, PoisonError};

/// Split-phase barrier between the subgroups of a work-group.
///
/// `arrive` never blocks; `wait` blocks until every subgroup arrived in the same phase.
pub trait SubgroupBarrier: Send {
    fn arrive(&mut self);
    fn wait(&mut self);

    fn sync(&mut self) {
        self.arrive();
        self.wait();
    }
}

#[derive(Default, Debug, Clone, Copy)]
/// Use when the subgroups of a work-group never share data
pub struct NoBarrier;

impl SubgroupBarrier for NoBarrier {
    fn arrive(&mut self) {}
    fn wait(&mut self) {}
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: usize,
}

#[derive(Debug)]
/// Work-group barrier shared by `count` subgroups.
pub struct SplitBarrier {
    count: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl SplitBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Handle used by one subgroup.
    pub fn handle(&self) -> BarrierHandle<'_> {
        BarrierHandle {
            barrier: self,
            phase: None,
        }
    }
}

#[derive(Debug)]
pub struct BarrierHandle<'a> {
    barrier: &'a SplitBarrier,
    /// Generation this subgroup arrived in and has not waited for yet.
    phase: Option<usize>,
}

impl SubgroupBarrier for BarrierHandle<'_> {
    fn arrive(&mut self) {
        debug_assert!(self.phase.is_none(), "arrive called twice without a wait");

        let mut state = self
            .barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.phase = Some(state.generation);
        state.arrived += 1;

        if state.arrived == self.barrier.count {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.barrier.released.notify_all();
        }
    }

    fn wait(&mut self) {
        let Some(phase) = self.phase.take() else {
            return;
        };

        let mut state = self
            .barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while state.generation == phase {
            state = self
                .barrier
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
