use hashbrown::HashMap;

use crate::components::{
    AccG, AccR, MatmulAvailabilityError, MatmulPrecision, Numeric, ProblemShape, SubgroupCoord,
    WorkgroupTiling,
    epilogue::{Epilogue, LinearCombination},
    global::{barrier::SubgroupBarrier, memory::OutputTensor},
    tile::Fragment,
};

/// Softmax over N of `act(alpha · acc + beta · C)`.
///
/// A row spans the `ATOM_N` subgroups of a work-group; their partial max and sum meet in the
/// work-group shared storage. Only problems whose rows fit in a single work-group tile can be
/// reduced this way.
pub struct RowSoftmax<'a, MP: MatmulPrecision> {
    combination: LinearCombination<'a, MP>,
}

#[derive(Default)]
/// Partial row statistics, keyed by `(row, subgroup column)`.
pub struct RowReductionStorage {
    max: spin::Mutex<HashMap<(usize, usize), f32>>,
    sum: spin::Mutex<HashMap<(usize, usize), f32>>,
}

impl<'a, MP: MatmulPrecision> RowSoftmax<'a, MP> {
    pub fn new(output: OutputTensor<'a, AccG<MP>>) -> Self {
        Self {
            combination: LinearCombination::new(output),
        }
    }

    /// Sets the linear combination applied before the softmax.
    pub fn with_combination(combination: LinearCombination<'a, MP>) -> Self {
        Self { combination }
    }
}

impl<MP: MatmulPrecision> Epilogue<MP> for RowSoftmax<'_, MP> {
    type SharedStorage = RowReductionStorage;

    fn can_implement(
        &self,
        problem: &ProblemShape,
        tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError> {
        let tile_n = tiling.tile().n;
        if problem.n > tile_n {
            return Err(MatmulAvailabilityError::RowTooWide {
                n: problem.n,
                tile_n,
            });
        }
        self.combination.check(problem)
    }

    fn store<B: SubgroupBarrier>(
        &self,
        acc: &Fragment<AccR<MP>>,
        coord: &SubgroupCoord,
        tiling: &WorkgroupTiling,
        shared: &Self::SharedStorage,
        barrier: &mut B,
    ) {
        let n = self.combination.output().shape().1;
        let group = coord.id % tiling.atoms().n;
        let groups = tiling.atoms().n;

        let mut values = Fragment::from_fn(acc.rows(), acc.cols(), |r, c| match coord.n + c < n {
            true => self.combination.apply_at(acc.get(r, c), coord, r, c) as f32,
            false => f32::NEG_INFINITY,
        });

        {
            let mut max = shared.max.lock();
            for r in 0..values.rows() {
                let row_max = values.row(r).iter().copied().fold(f32::NEG_INFINITY, f32::max);
                max.insert((coord.m + r, group), row_max);
            }
        }
        barrier.sync();

        let row_max: Vec<f32> = {
            let max = shared.max.lock();
            (0..values.rows())
                .map(|r| {
                    let value = (0..groups)
                        .filter_map(|g| max.get(&(coord.m + r, g)).copied())
                        .fold(f32::NEG_INFINITY, f32::max);
                    // Rows without any valid column.
                    match value == f32::NEG_INFINITY {
                        true => 0.0,
                        false => value,
                    }
                })
                .collect()
        };

        {
            let mut sum = shared.sum.lock();
            for (r, row_max) in row_max.iter().enumerate() {
                let row = values.row_mut(r);
                let mut partial = 0.0;
                for value in row.iter_mut() {
                    *value = (*value - row_max).exp();
                    partial += *value;
                }
                sum.insert((coord.m + r, group), partial);
            }
        }
        barrier.sync();

        let row_sum: Vec<f32> = {
            let sum = shared.sum.lock();
            (0..values.rows())
                .map(|r| {
                    (0..groups)
                        .filter_map(|g| sum.get(&(coord.m + r, g)).copied())
                        .sum()
                })
                .collect()
        };

        let out = Fragment::from_fn(values.rows(), values.cols(), |r, c| {
            let scale = match row_sum[r] == 0.0 || !row_sum[r].is_finite() {
                true => 1.0,
                false => 1.0 / row_sum[r],
            };
            AccG::<MP>::from_f32(values.get(r, c) * scale)
        });

        self.combination
            .output()
            .store(&out, coord.m, coord.n, coord.l);
    }
}
