//! Mainloop for operands stored in a narrower type than the one they are multiplied in.
//!
//! Fragments are converted right after their copy. Conversions move `packing` elements at a
//! time, the number of source elements filling one 32-bit register, bounded by the per-lane
//! fragment size.

use std::marker::PhantomData;

use crate::components::{
    AccR, FormattedConfigError, LhsG, LhsR, MatmulIdent, MatmulPrecision, MatmulProblem,
    MatmulSetupError, Numeric, OperandStream, RhsG, RhsR, TileShape, WorkgroupCoord,
    WorkgroupTiling,
    global::{
        CommonMainloopConfig, KTileRange, Mainloop, MainloopConfig, MainloopFamily,
        MainloopSelection, OperandViews, SubgroupContext,
        barrier::SubgroupBarrier,
        base::prefetch_operands,
        copy::CopyPlan,
        listener::{MainloopEvent, MainloopEventListener},
        prefetch::{PrefetchCursor, PrefetchPlan, PrefetchScope, Prefetcher},
    },
    tile::{Fragment, TileMmaConfig, tile_mma},
};

pub struct MixedInputMainloopFamily;

impl MainloopFamily for MixedInputMainloopFamily {
    type Mainloop<MP: MatmulPrecision> = MixedInputMainloop<MP>;
    type Config = MixedInputConfig;

    fn setup<MP: MatmulPrecision>(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self::Config, MatmulSetupError> {
        let common =
            CommonMainloopConfig::new::<MP>(problem, selection, PrefetchScope::Subgroup, false)?;

        MixedInputConfig {
            lhs_packing: select_packing::<LhsG<MP>, LhsR<MP>>(
                common.lhs_copy.values_per_lane(),
            ),
            rhs_packing: select_packing::<RhsG<MP>, RhsR<MP>>(
                common.rhs_copy.values_per_lane(),
            ),
            lhs_per_lane: common.lhs_copy.values_per_lane(),
            rhs_per_lane: common.rhs_copy.values_per_lane(),
            common,
        }
        .validate::<MP>()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MixedInputConfig {
    pub common: CommonMainloopConfig,
    /// Elements converted at once for A.
    pub lhs_packing: usize,
    /// Elements converted at once for B.
    pub rhs_packing: usize,
    lhs_per_lane: usize,
    rhs_per_lane: usize,
}

impl MixedInputConfig {
    fn validate<MP: MatmulPrecision>(self) -> Result<Self, MatmulSetupError> {
        for (name, packing, per_lane, full) in [
            (
                "A",
                self.lhs_packing,
                self.lhs_per_lane,
                register_packing::<LhsG<MP>, LhsR<MP>>(),
            ),
            (
                "B",
                self.rhs_packing,
                self.rhs_per_lane,
                register_packing::<RhsG<MP>, RhsR<MP>>(),
            ),
        ] {
            if packing == 0 || per_lane % packing != 0 {
                return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                    move || {
                        format!(
                            "Packing {packing} of operand {name} does not divide its {per_lane} elements per lane"
                        )
                    },
                )));
            }

            if packing < full {
                log::debug!(
                    "Operand {name} converts {packing} elements at once instead of {full}: \
                     {per_lane} elements per lane"
                );
            }
        }

        Ok(self)
    }
}

impl MainloopConfig for MixedInputConfig {
    fn tiling(&self) -> WorkgroupTiling {
        self.common.tiling()
    }

    fn stages(&self) -> usize {
        self.common.stages()
    }

    fn copy_plan(&self, ident: MatmulIdent) -> CopyPlan {
        self.common.copy_plan(ident)
    }

    fn prefetch_plan(&self, ident: MatmulIdent) -> PrefetchPlan {
        self.common.prefetch_plan(ident)
    }

    fn tile_mma(&self) -> TileMmaConfig {
        self.common.tile_mma()
    }

    fn uses_barrier(&self) -> bool {
        false
    }

    fn subgroup_tile(&self) -> TileShape {
        self.common.subgroup_tile()
    }

    fn describe(&self) -> String {
        format!(
            "{} | packing A {} B {}",
            self.common.describe(),
            self.lhs_packing,
            self.rhs_packing
        )
    }
}

/// Elements of the narrower of `S` and `D` fitting in one 32-bit register.
fn register_packing<S: Numeric, D: Numeric>() -> usize {
    (32 / S::BITS.min(D::BITS)) as usize
}

fn gcd(a: usize, b: usize) -> usize {
    match b {
        0 => a,
        _ => gcd(b, a % b),
    }
}

/// `gcd(per_lane, 32 / min(src_bits, dst_bits))`.
pub fn select_packing<S: Numeric, D: Numeric>(per_lane: usize) -> usize {
    gcd(per_lane, register_packing::<S, D>())
}

/// Converts `src` into `dst`.
///
/// Sub-byte sources are unpacked one element at a time; wider ones move `packing` elements per
/// conversion.
pub fn convert_fragment<S: Numeric, D: Numeric>(
    src: &Fragment<S>,
    dst: &mut Fragment<D>,
    packing: usize,
) {
    let src = src.as_slice();
    let dst = dst.as_mut_slice();

    if S::BITS < 8 {
        for (out, value) in dst.iter_mut().zip(src) {
            *out = D::from_f32(value.to_f32());
        }
        return;
    }

    for (out, chunk) in dst.chunks_mut(packing).zip(src.chunks(packing)) {
        let mut values = [0.0f32; 32];
        for (slot, value) in values.iter_mut().zip(chunk) {
            *slot = value.to_f32();
        }
        for (out, value) in out.iter_mut().zip(values) {
            *out = D::from_f32(value);
        }
    }
}

pub struct MixedInputMainloop<MP: MatmulPrecision> {
    _phantom: PhantomData<MP>,
}

impl<MP: MatmulPrecision> Mainloop<MP> for MixedInputMainloop<MP> {
    type Config = MixedInputConfig;

    fn run<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener>(
        views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
        acc: &mut Fragment<AccR<MP>>,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
        subgroup: &mut SubgroupContext<B, P, L>,
        config: Self::Config,
    ) {
        let tiling = config.tiling();
        let coord = tiling.subgroup_coord(workgroup, subgroup.id());
        let sg = tiling.subgroup_tile();
        let blk_k = tiling.tile().k;

        let copy_lhs = config.copy_plan(MatmulIdent::Lhs).with(&views.lhs);
        let copy_rhs = config.copy_plan(MatmulIdent::Rhs).with(&views.rhs);
        let mut lhs = Fragment::<LhsG<MP>>::zeros(sg.m, sg.k);
        let mut rhs = Fragment::<RhsG<MP>>::zeros(sg.k, sg.n);
        let mut mma_lhs = Fragment::<LhsR<MP>>::zeros(sg.m, sg.k);
        let mut mma_rhs = Fragment::<RhsR<MP>>::zeros(sg.k, sg.n);

        let mut prefetch = PrefetchCursor::warmup(config.stages(), k_tiles.count, |k| {
            prefetch_operands(views, workgroup, &coord, k_tiles.start + k, subgroup, &config)
        });

        for k_tile in k_tiles.iter() {
            copy_lhs.copy(coord.m, k_tile * blk_k, coord.l, &mut lhs);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Lhs,
                stream: OperandStream::Primary,
                k_tile,
            });
            copy_rhs.copy(k_tile * blk_k, coord.n, coord.l, &mut rhs);
            subgroup.emit(MainloopEvent::Load {
                ident: MatmulIdent::Rhs,
                stream: OperandStream::Primary,
                k_tile,
            });

            convert_fragment(&lhs, &mut mma_lhs, config.lhs_packing);
            subgroup.emit(MainloopEvent::Convert {
                ident: MatmulIdent::Lhs,
                k_tile,
            });
            convert_fragment(&rhs, &mut mma_rhs, config.rhs_packing);
            subgroup.emit(MainloopEvent::Convert {
                ident: MatmulIdent::Rhs,
                k_tile,
            });

            prefetch.advance(|k| {
                prefetch_operands(views, workgroup, &coord, k_tiles.start + k, subgroup, &config)
            });

            tile_mma(acc, &mma_lhs, &mma_rhs);
            subgroup.emit(MainloopEvent::Mma {
                stream: OperandStream::Primary,
                k_tile,
            });
        }
    }
}
