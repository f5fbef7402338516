use std::marker::PhantomData;

use cubecl_xe_matmul::{
    components::{
        AccG, LhsG, MatmulAvailabilityError, MatmulIdent, MatmulPrecision, ProblemShape, RhsG,
        WorkgroupCoord,
        global::{
            MainloopConfig, MainloopSelection, listener::MainloopEventListener,
            memory::OperandArguments, prefetch::Prefetcher,
        },
        tile::Fragment,
    },
    kernels::{
        gemm::{check_alignment, log_launch},
        workgroup::{LaunchReport, SubgroupOutcome, launch_workgroup, report},
    },
};

use crate::components::{
    AttentionProblem, AttentionSetupError,
    epilogue::AttentionEpilogue,
    mainloop::{AttentionConfig, AttentionViews, FlashAttentionMainloop},
    softmax::{OnlineSoftmax, RunningState},
};

/// Flash attention over a grid of query tiles, one grid row per head.
pub struct FlashAttentionKernel<MP: MatmulPrecision> {
    problem: AttentionProblem,
    config: AttentionConfig,
    softmax: OnlineSoftmax,
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> FlashAttentionKernel<MP> {
    pub fn can_implement(problem: &AttentionProblem) -> Result<(), MatmulAvailabilityError> {
        let scores = problem.score_problem();
        let values = problem.value_problem();

        check_alignment::<LhsG<MP>>(&scores, MatmulIdent::Lhs)?;
        check_alignment::<RhsG<MP>>(&scores, MatmulIdent::Rhs)?;
        check_alignment::<RhsG<MP>>(&values, MatmulIdent::Rhs)?;
        check_alignment::<AccG<MP>>(&values, MatmulIdent::Out)
    }

    /// Validates the problem and resolves both products. The softmax scale defaults to
    /// `1/sqrt(head_dim)`.
    pub fn setup(
        problem: &AttentionProblem,
        selection: &MainloopSelection,
    ) -> Result<Self, AttentionSetupError> {
        Self::can_implement(problem)?;
        let config = AttentionConfig::new::<MP>(problem, selection)?;

        let blk_k = config.tiling().tile().k;
        if problem.head_dim % blk_k != 0 {
            return Err(MatmulAvailabilityError::NotDivisible {
                dim: "head_dim",
                size: problem.head_dim,
                tile: blk_k,
            }
            .into());
        }

        if problem.causal {
            log::debug!(
                "Causal attention on {:?}: query tile {} visits at most {} key blocks",
                problem,
                config.tiling().tile().m,
                problem.seq_kv.div_ceil(config.tiling().tile().n)
            );
        }

        Ok(Self {
            problem: *problem,
            config,
            softmax: OnlineSoftmax::new(problem.default_scale()),
            _phantom: PhantomData,
        })
    }

    pub fn with_scale(mut self, softmax_scale: f32) -> Self {
        self.softmax = OnlineSoftmax::new(softmax_scale);
        self
    }

    pub fn config(&self) -> AttentionConfig {
        self.config
    }

    pub fn problem(&self) -> &AttentionProblem {
        &self.problem
    }

    pub fn to_underlying_arguments<'a>(
        &self,
        query: OperandArguments<'a, LhsG<MP>>,
        key: OperandArguments<'a, RhsG<MP>>,
        value: OperandArguments<'a, RhsG<MP>>,
    ) -> Result<AttentionViews<'a, LhsG<MP>, RhsG<MP>>, AttentionSetupError> {
        Ok(AttentionViews::new(&self.problem, query, key, value)?)
    }

    /// Query tiles of every head, head-major.
    pub fn workgroups(&self) -> impl Iterator<Item = WorkgroupCoord> {
        let queries = ProblemShape::new(
            self.problem.seq_q,
            1,
            self.problem.head_dim,
            self.problem.heads(),
        );
        self.config.tiling().workgroups(&queries)
    }

    pub fn launch<P, L>(
        &self,
        views: &AttentionViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &AttentionEpilogue<'_, MP>,
    ) -> Result<LaunchReport, AttentionSetupError>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
    {
        epilogue.can_implement(&self.problem)?;

        log_launch(
            "attention",
            &self.problem.score_problem(),
            &self.config.score,
            || {
                format!(
                    "value {} | causal {} scale {}",
                    self.config.value.describe(),
                    self.config.causal,
                    self.softmax.scale()
                )
            },
        );

        let mut launch = LaunchReport::default();
        for workgroup in self.workgroups() {
            let outcomes = self.run_workgroup::<P, L>(views, epilogue, &workgroup);
            launch.merge(report(&outcomes));
        }

        Ok(launch)
    }

    /// Body of one work-group: every key block of its query tile, then the epilogue.
    pub fn run_workgroup<P, L>(
        &self,
        views: &AttentionViews<'_, LhsG<MP>, RhsG<MP>>,
        epilogue: &AttentionEpilogue<'_, MP>,
        workgroup: &WorkgroupCoord,
    ) -> Vec<SubgroupOutcome<P, L>>
    where
        P: Prefetcher + Default,
        L: MainloopEventListener + Default,
    {
        let tiling = self.config.tiling();
        let sg = tiling.subgroup_tile();
        let key_blocks = self.config.key_blocks(self.problem.seq_kv, workgroup);

        launch_workgroup::<P, L, _>(tiling.num_subgroups(), |subgroup| {
            let mut out = Fragment::zeros(sg.m, self.problem.val_dim);
            let mut state = RunningState::init(sg.m);

            FlashAttentionMainloop::<MP>::run(
                views,
                &mut out,
                &mut state,
                &self.softmax,
                workgroup,
                key_blocks,
                subgroup,
                self.config,
            );

            let coord = tiling.subgroup_coord(workgroup, subgroup.id());
            epilogue.store(&out, &state, &coord);
        })
    }
}
