use std::marker::PhantomData;

use crate::components::{
    AccR, LhsG, MatmulPrecision, MatmulProblem, MatmulSetupError, RhsG, WorkgroupCoord,
    global::{
        CommonMainloopConfig, KTileRange, Mainloop, MainloopFamily, MainloopSelection,
        OperandViews, SubgroupContext,
        barrier::SubgroupBarrier,
        base::{check_same_precision, run_single_stream},
        listener::MainloopEventListener,
        prefetch::{PrefetchScope, Prefetcher},
    },
    tile::Fragment,
};

/// Multi-stage mainloop with work-group scoped prefetch and a barrier per K tile.
///
/// Handles row and column major operands.
pub struct PipelinedMainloopFamily;

impl MainloopFamily for PipelinedMainloopFamily {
    type Mainloop<MP: MatmulPrecision> = PipelinedMainloop<MP>;
    type Config = CommonMainloopConfig;

    fn setup<MP: MatmulPrecision>(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self::Config, MatmulSetupError> {
        check_same_precision::<MP>()?;
        CommonMainloopConfig::new::<MP>(problem, selection, PrefetchScope::Workgroup, true)
    }
}

pub struct PipelinedMainloop<MP: MatmulPrecision> {
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> Mainloop<MP> for PipelinedMainloop<MP> {
    type Config = CommonMainloopConfig;

    fn run<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener>(
        views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
        acc: &mut Fragment<AccR<MP>>,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
        subgroup: &mut SubgroupContext<B, P, L>,
        config: Self::Config,
    ) {
        run_single_stream::<MP, _, _, _, _>(views, acc, workgroup, k_tiles, subgroup, &config);
    }
}
