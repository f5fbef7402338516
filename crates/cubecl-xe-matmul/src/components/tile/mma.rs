use crate::components::{
    FormattedConfigError, MatmulSetupError, Numeric, TileShape, tile::Fragment,
    tiling::SUBGROUP_SIZE,
};

/// Depth of the systolic array, in 32-bit channels.
const SYSTOLIC_DEPTH: usize = 8;
/// Largest repeat count of one matrix instruction.
const MAX_REPEAT_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Shape of one subgroup matrix instruction.
pub struct MmaAtom {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MmaAtom {
    /// Atom for operands of type `E`: `8 x 16 x (8 * 32 / bits)`.
    pub fn for_elem<E: Numeric>() -> Self {
        let ops_per_channel = (32 / E::BITS.max(8)) as usize;
        Self {
            m: MAX_REPEAT_COUNT,
            n: SUBGROUP_SIZE,
            k: SYSTOLIC_DEPTH * ops_per_channel,
        }
    }

    /// Instruction name, e.g. `XE_8x16x16_F32BF16BF16F32_TT`.
    pub fn name<A: Numeric, B: Numeric, C: Numeric>(&self) -> String {
        format!(
            "XE_{}x{}x{}_{}{}{}{}_TT",
            self.m,
            self.n,
            self.k,
            C::NAME.to_uppercase(),
            A::NAME.to_uppercase(),
            B::NAME.to_uppercase(),
            C::NAME.to_uppercase()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Configuration of the tile matmul of one subgroup.
pub struct TileMmaConfig {
    pub atom: MmaAtom,
    /// Subgroup tile, `(SG_M, SG_N, SG_K)`.
    pub tile: TileShape,
}

impl TileMmaConfig {
    pub fn new<E: Numeric>(tile: TileShape) -> Result<Self, MatmulSetupError> {
        Self {
            atom: MmaAtom::for_elem::<E>(),
            tile,
        }
        .validate()
    }

    fn validate(self) -> Result<Self, MatmulSetupError> {
        let atom = self.atom;
        let tile = self.tile;

        if tile.m % atom.m != 0 || tile.n % atom.n != 0 || tile.k % atom.k != 0 {
            return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                move || {
                    format!(
                        "Subgroup tile {tile} is not a multiple of the matrix instruction {}x{}x{}",
                        atom.m, atom.n, atom.k
                    )
                },
            )));
        }

        Ok(self)
    }

    /// Number of atoms along M and N, `(FragsM, FragsN)`.
    pub fn frags(&self) -> (usize, usize) {
        (self.tile.m / self.atom.m, self.tile.n / self.atom.n)
    }
}

/// `acc += lhs · rhs` over a subgroup tile.
///
/// Every output element is reduced over K from low to high in the accumulator type, which
/// keeps the accumulation order identical across every mainloop.
pub fn tile_mma<A: Numeric, B: Numeric, C: Numeric>(
    acc: &mut Fragment<C>,
    lhs: &Fragment<A>,
    rhs: &Fragment<B>,
) {
    debug_assert_eq!(lhs.cols(), rhs.rows());
    debug_assert_eq!((acc.rows(), acc.cols()), (lhs.rows(), rhs.cols()));

    let depth = lhs.cols();

    for row in 0..acc.rows() {
        let lhs_row = lhs.row(row);
        for col in 0..acc.cols() {
            let mut sum = acc.get(row, col);
            for k in 0..depth {
                sum = sum.mul_add(lhs_row[k], rhs.get(k, col));
            }
            acc.set(row, col, sum);
        }
    }
}
