use hashbrown::HashMap;

use crate::{
    components::{
        AccR, LhsG, MatmulAvailabilityError, MatmulPrecision, MatmulProblem, MatmulSetupError,
        Numeric, RhsG, WorkgroupCoord,
        epilogue::Epilogue,
        global::{
            KTileRange, Mainloop, MainloopConfig, MainloopFamily, MainloopSelection,
            OperandViews, listener::MainloopEventListener, memory::OperandArguments,
            prefetch::Prefetcher,
        },
        tile::Fragment,
    },
    kernels::{
        gemm::{GemmKernel, log_launch},
        workgroup::{LaunchReport, launch_workgroup, report},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Share of the K range of one output tile, processed by one work-group.
pub struct StreamKUnit {
    /// Index of the output tile in the grid.
    pub tile: usize,
    pub workgroup: WorkgroupCoord,
    /// Position of the unit among the units of its tile.
    pub split: usize,
    pub k_tiles: KTileRange,
}

impl StreamKUnit {
    /// The last unit of a tile reduces the partials of the others and runs the epilogue.
    pub fn finishes_tile(&self, splits: usize) -> bool {
        self.split + 1 == splits
    }
}

/// GEMM splitting the K range of each output tile into `splits` contiguous units.
///
/// Partial accumulators go to a workspace; the fixup adds them in unit order.
pub struct StreamKKernel<MF: MainloopFamily, MP: MatmulPrecision> {
    gemm: GemmKernel<MF, MP>,
    splits: usize,
}

impl<MF: MainloopFamily, MP: MatmulPrecision> StreamKKernel<MF, MP> {
    pub fn setup(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
        splits: usize,
    ) -> Result<Self, MatmulSetupError> {
        let gemm = GemmKernel::<MF, MP>::setup(problem, selection)?;
        let k_tiles = problem.shape.k_tiles(gemm.config().tiling().tile().k);

        if splits == 0 || splits > k_tiles {
            return Err(MatmulAvailabilityError::InvalidSplit { splits, k_tiles }.into());
        }

        Ok(Self { gemm, splits })
    }

    pub fn to_underlying_arguments<'a>(
        &self,
        lhs: OperandArguments<'a, LhsG<MP>>,
        rhs: OperandArguments<'a, RhsG<MP>>,
    ) -> Result<OperandViews<'a, LhsG<MP>, RhsG<MP>>, MatmulSetupError> {
        self.gemm.to_underlying_arguments(lhs, rhs)
    }

    /// Every unit of the launch, tile by tile then in K order.
    pub fn units(&self) -> Vec<StreamKUnit> {
        let problem = self.gemm.problem();
        let tiling = self.gemm.config().tiling();
        let k_tiles = problem.shape.k_tiles(tiling.tile().k);

        tiling
            .workgroups(&problem.shape)
            .enumerate()
            .flat_map(|(tile, workgroup)| {
                (0..self.splits).map(move |split| {
                    let start = split * k_tiles / self.splits;
                    let end = (split + 1) * k_tiles / self.splits;
                    StreamKUnit {
                        tile,
                        workgroup,
                        split,
                        k_tiles: KTileRange::new(start, end - start),
                    }
                })
            })
            .collect()
    }

    pub fn launch<P, L, E>(
        &self,
        views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &E,
    ) -> Result<LaunchReport, MatmulSetupError>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: Epilogue<MP>,
    {
        let problem = self.gemm.problem();
        let config = self.gemm.config();
        let tiling = config.tiling();
        let sg = tiling.subgroup_tile();
        epilogue.can_implement(&problem.shape, &tiling)?;
        epilogue.store_plan(&tiling)?;

        log_launch("stream-k", problem, &config, || {
            format!("splits {}", self.splits)
        });

        let workspace = spin::Mutex::new(HashMap::<(usize, usize), Fragment<AccR<MP>>>::new());
        let mut launch = LaunchReport::default();

        for unit in self.units() {
            let shared = E::SharedStorage::default();
            let finishes = unit.finishes_tile(self.splits);

            let outcomes = launch_workgroup::<P, L, _>(tiling.num_subgroups(), |subgroup| {
                let mut acc = Fragment::zeros(sg.m, sg.n);
                <MF::Mainloop<MP> as Mainloop<MP>>::run(
                    views,
                    &mut acc,
                    &unit.workgroup,
                    unit.k_tiles,
                    subgroup,
                    config,
                );
                let key = (unit.tile, subgroup.id());

                if !finishes {
                    let mut workspace = workspace.lock();
                    let partial = workspace
                        .entry(key)
                        .or_insert_with(|| Fragment::zeros(sg.m, sg.n));
                    partial.zip_apply(&acc, <AccR<MP> as Numeric>::add);
                    return;
                }

                if let Some(partial) = workspace.lock().remove(&key) {
                    acc.zip_apply(&partial, <AccR<MP> as Numeric>::add);
                }

                let coord = tiling.subgroup_coord(&unit.workgroup, subgroup.id());
                epilogue.store(&acc, &coord, &tiling, &shared, subgroup.barrier());
            });

            launch.merge(report(&outcomes));
        }

        Ok(launch)
    }
}
