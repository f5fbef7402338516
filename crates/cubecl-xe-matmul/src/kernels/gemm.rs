use std::marker::PhantomData;

use crate::{
    components::{
        AccG, GemmMode, LhsG, MatmulAvailabilityError, MatmulIdent, MatmulPrecision,
        MatmulProblem, MatmulSetupError, MatrixLayout, Numeric, RhsG, WorkgroupCoord,
        epilogue::Epilogue,
        global::{
            KTileRange, Mainloop, MainloopConfig, MainloopFamily, MainloopSelection,
            OperandViews, listener::MainloopEventListener, memory::OperandArguments,
            prefetch::Prefetcher,
        },
        tile::Fragment,
    },
    config::{Logger, kernel::KernelLogLevel},
    kernels::workgroup::{LaunchReport, SubgroupOutcome, launch_workgroup, report},
};

/// Block transfers need the pitch of every tensor to be a multiple of 4 bytes.
const PITCH_ALIGNMENT_BITS: usize = 32;

/// Checks that the GEMM kernels can solve `problem` with the element types of `MP`.
pub fn can_implement_gemm<MP: MatmulPrecision>(
    problem: &MatmulProblem,
) -> Result<(), MatmulAvailabilityError> {
    let supported = match problem.mode {
        GemmMode::Gemm => problem.rank == 3 && problem.shape.l == 1,
        GemmMode::Batched => problem.rank == 4,
        GemmMode::Grouped => false,
    };
    if !supported {
        return Err(MatmulAvailabilityError::ModeUnsupported {
            mode: problem.mode.as_str(),
            rank: problem.rank,
        });
    }

    check_alignment::<LhsG<MP>>(problem, MatmulIdent::Lhs)?;
    check_alignment::<RhsG<MP>>(problem, MatmulIdent::Rhs)?;
    check_alignment::<AccG<MP>>(problem, MatmulIdent::Out)
}

/// Checks the pitch alignment of the contiguous dimension of one tensor.
pub fn check_alignment<E: Numeric>(
    problem: &MatmulProblem,
    ident: MatmulIdent,
) -> Result<(), MatmulAvailabilityError> {
    let (rows, cols, _) = problem.shape.shape(ident);
    let extent = match problem.layout(ident) {
        MatrixLayout::RowMajor => cols,
        MatrixLayout::ColMajor => rows,
    };

    match (extent * E::BITS as usize) % PITCH_ALIGNMENT_BITS {
        0 => Ok(()),
        _ => Err(MatmulAvailabilityError::Misaligned {
            ident,
            extent,
            elem_bits: E::BITS,
        }),
    }
}

/// GEMM over a grid of work-group tiles, each reducing the whole K range.
pub struct GemmKernel<MF: MainloopFamily, MP: MatmulPrecision> {
    problem: MatmulProblem,
    config: MF::Config,
    _phantom: PhantomData<MP>,
}

impl<MF: MainloopFamily, MP: MatmulPrecision> GemmKernel<MF, MP> {
    pub fn can_implement(problem: &MatmulProblem) -> Result<(), MatmulAvailabilityError> {
        can_implement_gemm::<MP>(problem)
    }

    /// Validates the problem and resolves the mainloop configuration.
    pub fn setup(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self, MatmulSetupError> {
        Self::can_implement(problem)?;
        let config = MF::setup::<MP>(problem, selection)?;

        Ok(Self {
            problem: problem.clone(),
            config,
            _phantom: PhantomData,
        })
    }

    pub fn config(&self) -> MF::Config {
        self.config
    }

    pub fn problem(&self) -> &MatmulProblem {
        &self.problem
    }

    /// Binds caller memory to the problem, once per launch.
    pub fn to_underlying_arguments<'a>(
        &self,
        lhs: OperandArguments<'a, LhsG<MP>>,
        rhs: OperandArguments<'a, RhsG<MP>>,
    ) -> Result<OperandViews<'a, LhsG<MP>, RhsG<MP>>, MatmulSetupError> {
        Ok(OperandViews::new(&self.problem, lhs, rhs)?)
    }

    /// Runs every work-group of the grid.
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
        let tiling = self.config.tiling();
        epilogue.can_implement(&self.problem.shape, &tiling)?;
        let store = epilogue.store_plan(&tiling)?;

        log_launch("gemm", &self.problem, &self.config, || {
            format!("store {}", store.transfer)
        });

        let k_tiles = KTileRange::full(self.problem.shape.k_tiles(tiling.tile().k));
        let mut launch = LaunchReport::default();

        for workgroup in tiling.workgroups(&self.problem.shape) {
            let outcomes = self.run_workgroup::<P, L, E>(views, epilogue, &workgroup, k_tiles);
            launch.merge(report(&outcomes));
        }

        Ok(launch)
    }

    /// Body of one work-group: mainloop over `k_tiles` then the epilogue.
    pub fn run_workgroup<P, L, E>(
        &self,
        views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &E,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
    ) -> Vec<SubgroupOutcome<P, L>>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
        E: Epilogue<MP>,
    {
        let tiling = self.config.tiling();
        let sg = tiling.subgroup_tile();
        let shared = E::SharedStorage::default();

        launch_workgroup::<P, L, _>(tiling.num_subgroups(), |subgroup| {
            let mut acc = Fragment::zeros(sg.m, sg.n);
            <MF::Mainloop<MP> as Mainloop<MP>>::run(
                views,
                &mut acc,
                workgroup,
                k_tiles,
                subgroup,
                self.config,
            );

            let coord = tiling.subgroup_coord(workgroup, subgroup.id());
            epilogue.store(&acc, &coord, &tiling, &shared, subgroup.barrier());
        })
    }
}

/// Logs the geometry of a launch, and its plans at the full level.
pub fn log_launch<C: MainloopConfig, F: Fn() -> String>(
    kernel: &str,
    problem: &MatmulProblem,
    config: &C,
    extra: F,
) {
    let mut logger = Logger::new();
    let tiling = config.tiling();

    match logger.log_level_kernel() {
        KernelLogLevel::Disabled => {}
        KernelLogLevel::Basic => logger.log_kernel(&format!(
            "[{kernel}] problem {:?} grid {:?} threads per workgroup {}",
            problem.shape,
            tiling.grid(&problem.shape),
            tiling.threads_per_workgroup(),
        )),
        KernelLogLevel::Full => logger.log_kernel(&format!(
            "[{kernel}] problem {:?} grid {:?} threads per workgroup {} | {} | {}",
            problem.shape,
            tiling.grid(&problem.shape),
            tiling.threads_per_workgroup(),
            config.describe(),
            extra(),
        )),
    }
}
