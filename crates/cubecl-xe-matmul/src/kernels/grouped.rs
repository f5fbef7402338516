use std::marker::PhantomData;

use crate::{
    components::{
        AccG, LhsG, MatmulAvailabilityError, MatmulIdent, MatmulPrecision, MatmulSetupError,
        MatrixLayout, ProblemShape, RhsG, WorkgroupCoord,
        epilogue::Epilogue,
        global::{
            CommonMainloopConfig, GroupedOperands, KTileRange, Mainloop, MainloopConfig,
            MainloopFamily, MainloopSelection, PipelinedMainloop, PipelinedMainloopFamily,
            group_problem, grouped_envelope,
            listener::{MainloopEvent, MainloopEventListener},
            prefetch::Prefetcher,
        },
        tile::Fragment,
    },
    kernels::{
        gemm::{check_alignment, log_launch},
        workgroup::{LaunchReport, launch_workgroup, report},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// One output tile of one group.
pub struct GroupedUnit {
    pub group: usize,
    pub workgroup: WorkgroupCoord,
}

/// Grouped GEMM on a persistent grid.
///
/// Work-group `w` of `W` processes units `w, w + W, ...` of the group-major unit list and only
/// rebinds its operand views when the group changes.
pub struct GroupedGemmKernel<MP: MatmulPrecision> {
    config: CommonMainloopConfig,
    problems: Vec<ProblemShape>,
    layouts: (MatrixLayout, MatrixLayout),
    workgroups: usize,
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> GroupedGemmKernel<MP> {
    pub fn can_implement(
        problems: &[ProblemShape],
        lhs_layout: MatrixLayout,
        rhs_layout: MatrixLayout,
    ) -> Result<(), MatmulAvailabilityError> {
        for shape in problems {
            let problem = group_problem(*shape, lhs_layout, rhs_layout);
            check_alignment::<LhsG<MP>>(&problem, MatmulIdent::Lhs)?;
            check_alignment::<RhsG<MP>>(&problem, MatmulIdent::Rhs)?;
            check_alignment::<AccG<MP>>(&problem, MatmulIdent::Out)?;
        }
        Ok(())
    }

    /// `workgroups` is the size of the persistent grid.
    pub fn setup(
        problems: &[ProblemShape],
        lhs_layout: MatrixLayout,
        rhs_layout: MatrixLayout,
        selection: &MainloopSelection,
        workgroups: usize,
    ) -> Result<Self, MatmulSetupError> {
        Self::can_implement(problems, lhs_layout, rhs_layout)?;

        if workgroups == 0 {
            return Err(MatmulSetupError::InvalidConfig(Box::new(
                "A persistent grid needs at least one work-group",
            )));
        }

        let envelope = group_problem(grouped_envelope(problems), lhs_layout, rhs_layout);
        let config = PipelinedMainloopFamily::setup::<MP>(&envelope, selection)?;

        Ok(Self {
            config,
            problems: problems.to_vec(),
            layouts: (lhs_layout, rhs_layout),
            workgroups,
            _phantom: PhantomData,
        })
    }

    /// Group-major list of every output tile.
    pub fn units(&self) -> Vec<GroupedUnit> {
        let tiling = self.config.tiling();

        self.problems
            .iter()
            .enumerate()
            .flat_map(|(group, shape)| {
                tiling
                    .workgroups(shape)
                    .map(move |workgroup| GroupedUnit { group, workgroup })
            })
            .collect()
    }

    /// Units processed by persistent work-group `worker`, in order.
    pub fn units_of(&self, worker: usize) -> Vec<GroupedUnit> {
        self.units()
            .into_iter()
            .skip(worker)
            .step_by(self.workgroups)
            .collect()
    }

    pub fn launch<P, L, E>(
        &self,
        operands: &GroupedOperands<'_, LhsG<MP>, RhsG<MP>>,
        epilogues: &[E],
    ) -> Result<LaunchReport, MatmulSetupError>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: Epilogue<MP>,
    {
        Ok(self
            .launch_traced::<P, L, E>(operands, epilogues)?
            .into_iter()
            .fold(LaunchReport::default(), |mut acc, (report, _)| {
                acc.merge(report);
                acc
            }))
    }

    /// Like [launch](Self::launch), returning the listener of every subgroup of every
    /// persistent work-group.
    pub fn launch_traced<P, L, E>(
        &self,
        operands: &GroupedOperands<'_, LhsG<MP>, RhsG<MP>>,
        epilogues: &[E],
    ) -> Result<Vec<(LaunchReport, Vec<L>)>, MatmulSetupError>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: Epilogue<MP>,
    {
        let groups = self.problems.len();
        for got in [operands.num_groups(), epilogues.len()] {
            if got != groups {
                return Err(MatmulAvailabilityError::GroupCountMismatch { groups, got }.into());
            }
        }

        let tiling = self.config.tiling();
        for (shape, epilogue) in self.problems.iter().zip(epilogues) {
            epilogue.can_implement(shape, &tiling)?;
        }
        let store = match epilogues.first() {
            Some(epilogue) => Some(epilogue.store_plan(&tiling)?),
            None => None,
        };

        let envelope = group_problem(
            grouped_envelope(&self.problems),
            self.layouts.0,
            self.layouts.1,
        );
        log_launch("grouped", &envelope, &self.config, || {
            format!(
                "groups {groups} persistent workgroups {} store {:?}",
                self.workgroups,
                store.map(|plan| plan.transfer.name())
            )
        });

        let sg = tiling.subgroup_tile();
        let blk_k = tiling.tile().k;
        let mut traces = Vec::with_capacity(self.workgroups);

        for worker in 0..self.workgroups {
            let units = self.units_of(worker);
            if units.is_empty() {
                continue;
            }
            let shared = E::SharedStorage::default();

            let outcomes = launch_workgroup::<P, L, _>(tiling.num_subgroups(), |subgroup| {
                let mut current = None;

                for unit in units.iter() {
                    if current.map(|(group, _)| group) != Some(unit.group) {
                        current = Some((unit.group, operands.update_tensor_shape_stride(unit.group)));
                        subgroup.emit(MainloopEvent::GroupSwitch { group: unit.group });
                    }
                    let Some((_, views)) = &current else {
                        continue;
                    };

                    let k_tiles = KTileRange::full(self.problems[unit.group].k_tiles(blk_k));
                    let mut acc = Fragment::zeros(sg.m, sg.n);
                    PipelinedMainloop::<MP>::run(
                        views,
                        &mut acc,
                        &unit.workgroup,
                        k_tiles,
                        subgroup,
                        self.config,
                    );

                    let coord = tiling.subgroup_coord(&unit.workgroup, subgroup.id());
                    epilogues[unit.group].store(
                        &acc,
                        &coord,
                        &tiling,
                        &shared,
                        subgroup.barrier(),
                    );
                }
            });

            let mut launch = report(&outcomes);
            launch.workgroups = units.len();
            traces.push((
                launch,
                outcomes
                    .into_iter()
                    .map(|outcome| outcome.listener)
                    .collect(),
            ));
        }

        Ok(traces)
    }
}
