use std::marker::PhantomData;

use cubecl_xe_matmul::components::{
    FormattedConfigError, LhsG, LhsR, MatmulAvailabilityError, MatmulIdent, MatmulPrecision,
    MatmulSetupError, MatrixLayout, Numeric, OperandStream, RhsG, RhsR, TileShape,
    WorkgroupCoord, WorkgroupTiling, same_type,
    global::{
        CommonMainloopConfig, MainloopConfig, MainloopSelection, OperandViews, SubgroupContext,
        barrier::SubgroupBarrier,
        listener::{MainloopEvent, MainloopEventListener},
        memory::{OperandArguments, TensorView},
        prefetch::{PrefetchCursor, PrefetchScope, Prefetcher},
    },
    tile::{Fragment, tile_mma},
};

use crate::components::{
    AttentionProblem,
    softmax::{OnlineSoftmax, RunningState},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Plans of the two products of the attention mainloop.
pub struct AttentionConfig {
    /// `Q·Kᵗ` over `(BLK_M, BLK_N, BLK_K)` tiles, K tiles walking the head dimension.
    pub score: CommonMainloopConfig,
    /// `P·V` over `(BLK_M, val_dim, BLK_N)` tiles, K tiles walking the key blocks.
    pub value: CommonMainloopConfig,
    pub causal: bool,
}

impl AttentionConfig {
    pub fn new<MP: MatmulPrecision>(
        problem: &AttentionProblem,
        selection: &MainloopSelection,
    ) -> Result<Self, MatmulSetupError> {
        if !same_type::<LhsG<MP>, LhsR<MP>>() || !same_type::<RhsG<MP>, RhsR<MP>>() {
            return Err(MatmulSetupError::InvalidConfig(Box::new(
                "Attention reads Q, K and V in their compute type",
            )));
        }

        let atoms = selection.atoms;
        if atoms.n != 1 {
            return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                move || {
                    format!(
                        "Subgroup arrangement {atoms} splits the key block, attention subgroups own whole rows"
                    )
                },
            )));
        }

        let score = CommonMainloopConfig::new::<MP>(
            &problem.score_problem(),
            selection,
            PrefetchScope::Workgroup,
            true,
        )?;
        let value_selection = MainloopSelection {
            tile: TileShape::new(selection.tile.m, problem.val_dim, selection.tile.n),
            atoms,
            stages: selection.stages,
        };
        let value = CommonMainloopConfig::new::<MP>(
            &problem.value_problem(),
            &value_selection,
            PrefetchScope::Workgroup,
            true,
        )?;

        Ok(Self {
            score,
            value,
            causal: problem.causal,
        })
    }

    pub fn tiling(&self) -> WorkgroupTiling {
        self.score.tiling()
    }

    pub fn stages(&self) -> usize {
        self.score.stages()
    }

    /// Number of key blocks the work-group at `workgroup` has to visit.
    ///
    /// With a causal mask, blocks starting after the last query row of the tile are skipped.
    pub fn key_blocks(&self, seq_kv: usize, workgroup: &WorkgroupCoord) -> usize {
        let tile = self.tiling().tile();
        let blocks = seq_kv.div_ceil(tile.n);

        match self.causal {
            true => {
                let last_row = (workgroup.m + 1) * tile.m - 1;
                blocks.min(last_row / tile.n + 1)
            }
            false => blocks,
        }
    }
}

#[derive(Clone, Copy)]
/// Views over the query, key and value of every head.
pub struct AttentionViews<'a, Q, KV> {
    /// `(seq_q, head_dim, heads)`
    pub query: TensorView<'a, Q>,
    /// `(head_dim, seq_kv, heads)`, the key seen as the transposed B operand.
    pub key: TensorView<'a, KV>,
    /// `(seq_kv, val_dim, heads)`
    pub value: TensorView<'a, KV>,
}

impl<'a, Q: Numeric, KV: Numeric> AttentionViews<'a, Q, KV> {
    pub fn new(
        problem: &AttentionProblem,
        query: OperandArguments<'a, Q>,
        key: OperandArguments<'a, KV>,
        value: OperandArguments<'a, KV>,
    ) -> Result<Self, MatmulAvailabilityError> {
        let scores = OperandViews::new(&problem.score_problem(), query, key)?;
        let value = TensorView::new(
            MatmulIdent::Rhs,
            value,
            (problem.seq_kv, problem.val_dim, problem.heads()),
            MatrixLayout::RowMajor,
        )?;

        Ok(Self {
            query: scores.lhs,
            key: scores.rhs,
            value,
        })
    }
}

/// Hides keys past the end of the sequence, and keys after the query when causal.
pub fn apply_mask(
    scores: &mut Fragment<f32>,
    first_row: usize,
    first_col: usize,
    seq_kv: usize,
    causal: bool,
) {
    for row in 0..scores.rows() {
        let query = first_row + row;
        for (col, score) in scores.row_mut(row).iter_mut().enumerate() {
            let key = first_col + col;
            if key >= seq_kv || (causal && key > query) {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

/// Fused `softmax(Q·Kᵗ)·V` over the key blocks of one work-group tile.
///
/// The query tile stays in registers. For every key block, the subgroup computes its scores
/// against K, masks them, folds them in the online softmax, converts the probabilities to the
/// compute type and accumulates them against V. Events use the key block as `k_tile`, except
/// key prefetches which report the head tile they cover.
pub struct FlashAttentionMainloop<MP: MatmulPrecision> {
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> FlashAttentionMainloop<MP> {
    #[allow(clippy::too_many_arguments)]
    pub fn run<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener>(
        views: &AttentionViews<'_, LhsG<MP>, RhsG<MP>>,
        out: &mut Fragment<f32>,
        state: &mut RunningState,
        softmax: &OnlineSoftmax,
        workgroup: &WorkgroupCoord,
        key_blocks: usize,
        subgroup: &mut SubgroupContext<B, P, L>,
        config: AttentionConfig,
    ) {
        let tiling = config.tiling();
        let coord = tiling.subgroup_coord(workgroup, subgroup.id());
        let tile = tiling.tile();
        let sg = tiling.subgroup_tile();
        let (head_dim, seq_kv, _) = views.key.shape();
        let head_tiles = head_dim.div_ceil(tile.k);

        let copy_query = config.score.copy_plan(MatmulIdent::Lhs).with(&views.query);
        let copy_key = config.score.copy_plan(MatmulIdent::Rhs).with(&views.key);
        let copy_value = config.value.copy_plan(MatmulIdent::Rhs).with(&views.value);

        let query: Vec<Fragment<LhsG<MP>>> = (0..head_tiles)
            .map(|head_tile| {
                let mut fragment = Fragment::zeros(sg.m, sg.k);
                copy_query.copy(coord.m, head_tile * tile.k, coord.l, &mut fragment);
                fragment
            })
            .collect();
        subgroup.emit(MainloopEvent::Load {
            ident: MatmulIdent::Lhs,
            stream: OperandStream::Primary,
            k_tile: 0,
        });

        let mut key = Fragment::<RhsG<MP>>::zeros(sg.k, sg.n);
        let mut value = Fragment::<RhsG<MP>>::zeros(tile.n, out.cols());

        let prefetch_block = |subgroup: &mut SubgroupContext<B, P, L>, block: usize| {
            let block_coord = WorkgroupCoord::new(workgroup.m, block, 0, workgroup.l);
            for head_tile in 0..head_tiles {
                subgroup.prefetch(
                    &config.score.prefetch_plan(MatmulIdent::Rhs),
                    &views.key,
                    &block_coord,
                    &coord,
                    OperandStream::Primary,
                    head_tile,
                );
            }
            subgroup.prefetch(
                &config.value.prefetch_plan(MatmulIdent::Rhs),
                &views.value,
                &WorkgroupCoord::new(workgroup.m, 0, 0, workgroup.l),
                &coord,
                OperandStream::Secondary,
                block,
            );
        };

        let mut cursor = PrefetchCursor::warmup(config.stages(), key_blocks, |block| {
            prefetch_block(subgroup, block)
        });

        for block in 0..key_blocks {
            subgroup.arrive(block);

            let mut scores = Fragment::<f32>::zeros(sg.m, sg.n);
            for (head_tile, query) in query.iter().enumerate() {
                copy_key.copy(head_tile * tile.k, block * tile.n, coord.l, &mut key);
                tile_mma(&mut scores, query, &key);
            }
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Rhs,
                stream: OperandStream::Primary,
                k_tile: block,
            });
            subgroup.emit(MainloopEvent::Mma {
                stream: OperandStream::Primary,
                k_tile: block,
            });

            cursor.advance(|block| prefetch_block(subgroup, block));

            apply_mask(&mut scores, coord.m, block * tile.n, seq_kv, config.causal);
            softmax.run(block == 0, &mut scores, state, out);
            let probs = scores.map(LhsR::<MP>::from_f32);

            copy_value.copy(block * tile.n, 0, coord.l, &mut value);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Rhs,
                stream: OperandStream::Secondary,
                k_tile: block,
            });
            tile_mma(out, &probs, &value);
            subgroup.emit(MainloopEvent::Mma {
                stream: OperandStream::Secondary,
                k_tile: block,
            });

            subgroup.wait(block);
        }
    }
}
