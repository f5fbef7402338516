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

/// Single pass mainloop: subgroup scoped prefetch, no barrier.
///
/// Subgroups never wait on each other, so it only supports row major operands whose prefetch
/// slices are shared between peers of the same subgroup row or column.
pub struct UnpredicatedMainloopFamily;

impl MainloopFamily for UnpredicatedMainloopFamily {
    type Mainloop<MP: MatmulPrecision> = UnpredicatedMainloop<MP>;
    type Config = CommonMainloopConfig;

    fn setup<MP: MatmulPrecision>(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self::Config, MatmulSetupError> {
        check_same_precision::<MP>()?;
        CommonMainloopConfig::new::<MP>(problem, selection, PrefetchScope::Subgroup, false)
    }
}

pub struct UnpredicatedMainloop<MP: MatmulPrecision> {
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> Mainloop<MP> for UnpredicatedMainloop<MP> {
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
