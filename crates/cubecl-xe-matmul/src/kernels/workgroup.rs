use crate::components::global::{
    SubgroupContext,
    barrier::{BarrierHandle, SplitBarrier},
    listener::MainloopEventListener,
    prefetch::Prefetcher,
};

/// Summary of a launch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchReport {
    /// Work-group bodies executed.
    pub workgroups: usize,
    /// Prefetches issued by every subgroup.
    pub prefetches: usize,
}

impl LaunchReport {
    pub fn merge(&mut self, other: LaunchReport) {
        self.workgroups += other.workgroups;
        self.prefetches += other.prefetches;
    }
}

/// What a subgroup leaves behind: its prefetch unit and its listener.
pub struct SubgroupOutcome<P, L> {
    pub prefetcher: P,
    pub listener: L,
}

/// Runs one work-group: `num_subgroups` subgroups execute `body` concurrently and share a
/// split barrier.
///
/// A panicking subgroup fails the whole launch once every other subgroup is joined.
pub fn launch_workgroup<P, L, F>(num_subgroups: usize, body: F) -> Vec<SubgroupOutcome<P, L>>
where
    P: Prefetcher + Default,
    L: MainloopEventListener + Default,
    F: for<'b> Fn(&mut SubgroupContext<BarrierHandle<'b>, P, L>) + Sync,
{
    let barrier = SplitBarrier::new(num_subgroups);

    let run = |id: usize| {
        let mut subgroup = SubgroupContext::new(id, barrier.handle(), P::default(), L::default());
        body(&mut subgroup);
        let (prefetcher, listener) = subgroup.into_parts();
        SubgroupOutcome {
            prefetcher,
            listener,
        }
    };

    if num_subgroups == 1 {
        return vec![run(0)];
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..num_subgroups)
            .map(|id| {
                let run = &run;
                scope.spawn(move || run(id))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(outcome) => outcome,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}

/// Report of one work-group.
pub fn report<P: Prefetcher, L>(outcomes: &[SubgroupOutcome<P, L>]) -> LaunchReport {
    LaunchReport {
        workgroups: 1,
        prefetches: outcomes
            .iter()
            .map(|outcome| outcome.prefetcher.issued())
            .sum(),
    }
}
