//! Work-group tile decomposition into subgroup tiles.

use serde::{Deserialize, Serialize};

use crate::components::{MatmulSetupError, ProblemShape, error::indivisible_tile};

/// Number of lanes in a subgroup.
pub const SUBGROUP_SIZE: usize = 16;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, new,
)]
#[display("{m}x{n}x{k}")]
/// Sizes along M, N and K of a tile.
pub struct TileShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl TileShape {
    pub fn mn(&self) -> usize {
        self.m * self.n
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, new,
)]
#[display("{m}x{n}x{k}")]
/// How many subgroups cooperate along each dimension of a work-group tile.
pub struct SubgroupArrangement {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl SubgroupArrangement {
    pub fn count(&self) -> usize {
        self.m * self.n * self.k
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, new)]
/// Index of a work-group tile in the tile grid, with the K tile it starts at.
pub struct WorkgroupCoord {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub l: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Origin of a subgroup tile in the global tensors.
pub struct SubgroupCoord {
    /// Linear id of the subgroup in its work-group.
    pub id: usize,
    /// First output row owned by the subgroup.
    pub m: usize,
    /// First output column owned by the subgroup.
    pub n: usize,
    /// Batch index.
    pub l: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Static geometry of a work-group: its tile shape and subgroup arrangement.
///
/// Construction validates that the tile splits evenly between subgroups, so every other
/// computation on it is infallible.
pub struct WorkgroupTiling {
    tile: TileShape,
    atoms: SubgroupArrangement,
}

impl WorkgroupTiling {
    pub fn new(tile: TileShape, atoms: SubgroupArrangement) -> Result<Self, MatmulSetupError> {
        Self { tile, atoms }.validate()
    }

    fn validate(self) -> Result<Self, MatmulSetupError> {
        let tile = self.tile;
        let atoms = self.atoms;

        if tile.m == 0 || tile.n == 0 || tile.k == 0 {
            return Err(MatmulSetupError::InvalidConfig(Box::new(format!(
                "Tile shape {tile} must be non empty"
            ))));
        }
        if atoms.count() == 0 {
            return Err(MatmulSetupError::InvalidConfig(Box::new(format!(
                "Subgroup arrangement {atoms} must have at least one subgroup"
            ))));
        }

        for (dim, size, count) in [
            ("M", tile.m, atoms.m),
            ("N", tile.n, atoms.n),
            ("K", tile.k, atoms.k),
        ] {
            if size % count != 0 {
                return Err(indivisible_tile(tile, dim, count));
            }
        }

        Ok(self)
    }

    pub fn tile(&self) -> TileShape {
        self.tile
    }

    pub fn atoms(&self) -> SubgroupArrangement {
        self.atoms
    }

    /// Tile computed by one subgroup: `ceil_div(tile, atoms)`.
    pub fn subgroup_tile(&self) -> TileShape {
        TileShape {
            m: self.tile.m.div_ceil(self.atoms.m),
            n: self.tile.n.div_ceil(self.atoms.n),
            k: self.tile.k.div_ceil(self.atoms.k),
        }
    }

    pub fn num_subgroups(&self) -> usize {
        self.atoms.count()
    }

    pub fn threads_per_workgroup(&self) -> usize {
        self.num_subgroups() * SUBGROUP_SIZE
    }

    /// Maps a subgroup of the work-group at `workgroup` to the origin of its output tile.
    ///
    /// Subgroup ids are laid out row major over `(ATOM_M, ATOM_N)`. The prefetch plans rely on
    /// this mapping to spread their cache lines.
    pub fn subgroup_coord(&self, workgroup: &WorkgroupCoord, subgroup_id: usize) -> SubgroupCoord {
        let sg = self.subgroup_tile();

        SubgroupCoord {
            id: subgroup_id,
            m: workgroup.m * self.tile.m + (subgroup_id / self.atoms.n) * sg.m,
            n: workgroup.n * self.tile.n + (subgroup_id % self.atoms.n) * sg.n,
            l: workgroup.l,
        }
    }

    /// Number of work-groups along M, N and L needed to cover the problem.
    pub fn grid(&self, problem: &ProblemShape) -> (usize, usize, usize) {
        (
            problem.m.div_ceil(self.tile.m),
            problem.n.div_ceil(self.tile.n),
            problem.l,
        )
    }

    /// Every work-group coordinate of the grid, batch-major then row-major.
    pub fn workgroups(&self, problem: &ProblemShape) -> impl Iterator<Item = WorkgroupCoord> + use<> {
        let (grid_m, grid_n, grid_l) = self.grid(problem);

        (0..grid_l).flat_map(move |l| {
            (0..grid_m).flat_map(move |m| (0..grid_n).map(move |n| WorkgroupCoord::new(m, n, 0, l)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiling(tile: (usize, usize, usize), atoms: (usize, usize, usize)) -> WorkgroupTiling {
        WorkgroupTiling::new(
            TileShape::new(tile.0, tile.1, tile.2),
            SubgroupArrangement::new(atoms.0, atoms.1, atoms.2),
        )
        .unwrap()
    }

    #[test]
    fn subgroup_tile_is_ceil_div_of_tile() {
        let tiling = tiling((256, 256, 32), (8, 4, 1));

        assert_eq!(tiling.subgroup_tile(), TileShape::new(32, 64, 32));
        assert_eq!(tiling.num_subgroups(), 32);
        assert_eq!(tiling.threads_per_workgroup(), 512);
    }

    #[test]
    fn subgroup_ids_are_row_major_over_atoms() {
        let tiling = tiling((64, 64, 32), (2, 4, 1));
        let wg = WorkgroupCoord::new(1, 2, 0, 3);

        let coord = tiling.subgroup_coord(&wg, 5);

        // id 5 -> row group 1, col group 1
        assert_eq!(coord.m, 64 + 32);
        assert_eq!(coord.n, 128 + 16);
        assert_eq!(coord.l, 3);
    }

    #[test]
    fn indivisible_tile_is_rejected() {
        let result = WorkgroupTiling::new(TileShape::new(48, 64, 32), SubgroupArrangement::new(5, 1, 1));

        let err = result.unwrap_err().to_string();
        assert!(err.contains("along M"), "{err}");
    }

    #[test]
    fn grid_rounds_up() {
        let tiling = tiling((32, 64, 32), (1, 1, 1));

        assert_eq!(tiling.grid(&ProblemShape::new(33, 64, 16, 2)), (2, 1, 2));
        assert_eq!(tiling.workgroups(&ProblemShape::new(33, 64, 16, 2)).count(), 4);
    }
}
