use std::marker::PhantomData;

use crate::{
    components::{
        LhsG, MatmulPrecision, MatmulProblem, MatmulSetupError, RhsG, WorkgroupCoord,
        epilogue::DualEpilogue,
        global::{
            CommonMainloopConfig, DualMainloop, DualOperandViews, KTileRange, MainloopConfig,
            MainloopSelection, listener::MainloopEventListener, memory::OperandArguments,
            prefetch::Prefetcher,
        },
        tile::Fragment,
    },
    kernels::{
        gemm::{can_implement_gemm, log_launch},
        workgroup::{LaunchReport, SubgroupOutcome, launch_workgroup, report},
    },
};

/// `D = epilogue(A·B0, A·B1)` where both products share the A stream.
pub struct DualGemmKernel<MP: MatmulPrecision> {
    problem: MatmulProblem,
    config: CommonMainloopConfig,
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> DualGemmKernel<MP> {
    pub fn setup(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self, MatmulSetupError> {
        can_implement_gemm::<MP>(problem)?;
        let config = DualMainloop::<MP>::setup(problem, selection)?;

        Ok(Self {
            problem: problem.clone(),
            config,
            _phantom: PhantomData,
        })
    }

    pub fn to_underlying_arguments<'a>(
        &self,
        lhs: OperandArguments<'a, LhsG<MP>>,
        rhs0: OperandArguments<'a, RhsG<MP>>,
        rhs1: OperandArguments<'a, RhsG<MP>>,
    ) -> Result<DualOperandViews<'a, LhsG<MP>, RhsG<MP>>, MatmulSetupError> {
        Ok(DualOperandViews::new(&self.problem, lhs, rhs0, rhs1)?)
    }

    pub fn launch<P, L, E>(
        &self,
        views: &DualOperandViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &E,
    ) -> Result<LaunchReport, MatmulSetupError>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: DualEpilogue<MP>,
    {
        let tiling = self.config.tiling();
        epilogue.can_implement(&self.problem.shape, &tiling)?;

        log_launch("dual", &self.problem, &self.config, String::new);

        let k_tiles = KTileRange::full(self.problem.shape.k_tiles(tiling.tile().k));
        let mut launch = LaunchReport::default();

        for workgroup in tiling.workgroups(&self.problem.shape) {
            let outcomes = self.run_workgroup::<P, L, E>(views, epilogue, &workgroup, k_tiles);
            launch.merge(report(&outcomes));
        }

        Ok(launch)
    }

    pub fn run_workgroup<P, L, E>(
        &self,
        views: &DualOperandViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &E,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
    ) -> Vec<SubgroupOutcome<P, L>>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: DualEpilogue<MP>,
    {
        let tiling = self.config.tiling();
        let sg = tiling.subgroup_tile();

        launch_workgroup::<P, L, _>(tiling.num_subgroups(), |subgroup| {
            let mut acc0 = Fragment::zeros(sg.m, sg.n);
            let mut acc1 = Fragment::zeros(sg.m, sg.n);
            DualMainloop::<MP>::run(
                views,
                &mut acc0,
                &mut acc1,
                workgroup,
                k_tiles,
                subgroup,
                self.config,
            );

            let coord = tiling.subgroup_coord(workgroup, subgroup.id());
            epilogue.store(&acc0, &acc1, &coord);
        })
    }
}
