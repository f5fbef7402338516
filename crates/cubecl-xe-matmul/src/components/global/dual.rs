use std::marker::PhantomData;

use crate::components::{
    AccR, LhsG, MatmulAvailabilityError, MatmulIdent, MatmulPrecision, MatmulProblem,
    MatmulSetupError, Numeric, OperandStream, RhsG, WorkgroupCoord,
    global::{
        CommonMainloopConfig, KTileRange, MainloopConfig, MainloopSelection, OperandViews,
        SubgroupContext,
        barrier::SubgroupBarrier,
        base::check_same_precision,
        listener::{MainloopEvent, MainloopEventListener},
        memory::{OperandArguments, TensorView},
        prefetch::{PrefetchCursor, PrefetchScope, Prefetcher},
    },
    tile::{Fragment, tile_mma},
};

/// Views of a dual GEMM: `D0 = A·B0` and `D1 = A·B1` share the A stream.
#[derive(Clone, Copy)]
pub struct DualOperandViews<'a, A, B> {
    pub lhs: TensorView<'a, A>,
    pub rhs0: TensorView<'a, B>,
    pub rhs1: TensorView<'a, B>,
}

impl<'a, A: Numeric, B: Numeric> DualOperandViews<'a, A, B> {
    pub fn new(
        problem: &MatmulProblem,
        lhs: OperandArguments<'a, A>,
        rhs0: OperandArguments<'a, B>,
        rhs1: OperandArguments<'a, B>,
    ) -> Result<Self, MatmulAvailabilityError> {
        let primary = OperandViews::new(problem, lhs, rhs0)?;
        let secondary = TensorView::new(
            MatmulIdent::Rhs,
            rhs1,
            problem.shape.shape(MatmulIdent::Rhs),
            problem.rhs_layout,
        )?;

        Ok(Self {
            lhs: primary.lhs,
            rhs0: primary.rhs,
            rhs1: secondary,
        })
    }
}

/// Pipelined mainloop over one A stream and two B streams.
///
/// Both B streams share the plans of B, prefetches are issued A, B0 then B1.
pub struct DualMainloop<MP: MatmulPrecision> {
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> DualMainloop<MP> {
    pub fn setup(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<CommonMainloopConfig, MatmulSetupError> {
        check_same_precision::<MP>()?;
        CommonMainloopConfig::new::<MP>(problem, selection, PrefetchScope::Workgroup, true)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener>(
        views: &DualOperandViews<'_, LhsG<MP>, RhsG<MP>>,
        acc0: &mut Fragment<AccR<MP>>,
        acc1: &mut Fragment<AccR<MP>>,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
        subgroup: &mut SubgroupContext<B, P, L>,
        config: CommonMainloopConfig,
    ) {
        let tiling = config.tiling();
        let coord = tiling.subgroup_coord(workgroup, subgroup.id());
        let sg = tiling.subgroup_tile();
        let blk_k = tiling.tile().k;

        let copy_lhs = config.copy_plan(MatmulIdent::Lhs).with(&views.lhs);
        let copy_rhs0 = config.copy_plan(MatmulIdent::Rhs).with(&views.rhs0);
        let copy_rhs1 = config.copy_plan(MatmulIdent::Rhs).with(&views.rhs1);
        let mut lhs = Fragment::<LhsG<MP>>::zeros(sg.m, sg.k);
        let mut rhs0 = Fragment::<RhsG<MP>>::zeros(sg.k, sg.n);
        let mut rhs1 = Fragment::<RhsG<MP>>::zeros(sg.k, sg.n);

        let prefetch = |subgroup: &mut SubgroupContext<B, P, L>, k_tile: usize| {
            let lhs_plan = config.prefetch_plan(MatmulIdent::Lhs);
            let rhs_plan = config.prefetch_plan(MatmulIdent::Rhs);

            subgroup.prefetch(
                &lhs_plan,
                &views.lhs,
                workgroup,
                &coord,
                OperandStream::Primary,
                k_tile,
            );
            subgroup.prefetch(
                &rhs_plan,
                &views.rhs0,
                workgroup,
                &coord,
                OperandStream::Primary,
                k_tile,
            );
            subgroup.prefetch(
                &rhs_plan,
                &views.rhs1,
                workgroup,
                &coord,
                OperandStream::Secondary,
                k_tile,
            );
        };

        let mut cursor = PrefetchCursor::warmup(config.stages(), k_tiles.count, |k| {
            prefetch(subgroup, k_tiles.start + k)
        });

        for k_tile in k_tiles.iter() {
            subgroup.arrive(k_tile);

            copy_lhs.copy(coord.m, k_tile * blk_k, coord.l, &mut lhs);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Lhs,
                stream: OperandStream::Primary,
                k_tile,
            });
            copy_rhs0.copy(k_tile * blk_k, coord.n, coord.l, &mut rhs0);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Rhs,
                stream: OperandStream::Primary,
                k_tile,
            });
            copy_rhs1.copy(k_tile * blk_k, coord.n, coord.l, &mut rhs1);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Rhs,
                stream: OperandStream::Secondary,
                k_tile,
            });

            cursor.advance(|k| prefetch(subgroup, k_tiles.start + k));

            tile_mma(acc0, &lhs, &rhs0);
            subgroup.emit(MainloopEvent::Mma {
                stream: OperandStream::Primary,
                k_tile,
            });
            tile_mma(acc1, &lhs, &rhs1);
            subgroup.emit(MainloopEvent::Mma {
                stream: OperandStream::Secondary,
                k_tile,
            });

            subgroup.wait(k_tile);
        }
    }
}
