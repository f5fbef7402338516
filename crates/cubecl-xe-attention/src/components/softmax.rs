//! Online softmax over the key blocks of a row.
//!
//! The scores of a row arrive one key block at a time. The running max `m` and sum `l` of
//! every row are rescaled when a larger max shows up, together with the output accumulated so
//! far, so the final division by `l` can wait for the epilogue.

use std::f32::consts::LOG2_E;

use cubecl_xe_matmul::components::{
    tile::{Fragment, lane_of},
    tiling::SUBGROUP_SIZE,
};

#[derive(Clone, Debug, PartialEq)]
/// One value per row of a subgroup tile.
pub struct RowWise {
    vals: Vec<f32>,
}

impl RowWise {
    pub fn new_filled(num_rows: usize, val: f32) -> RowWise {
        RowWise {
            vals: vec![val; num_rows],
        }
    }

    pub fn new_min_value(num_rows: usize) -> RowWise {
        Self::new_filled(num_rows, f32::NEG_INFINITY)
    }

    pub fn new_zero(num_rows: usize) -> RowWise {
        Self::new_filled(num_rows, 0.0)
    }

    pub fn num_rows(&self) -> usize {
        self.vals.len()
    }

    pub fn index(&self, i: usize) -> f32 {
        self.vals[i]
    }

    pub fn replace_at(&mut self, i: usize, val: f32) {
        self.vals[i] = val;
    }

    pub fn copy_from(&mut self, other: &RowWise) {
        self.vals.copy_from_slice(&other.vals);
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.vals
    }
}

#[derive(Clone, Debug)]
/// Running max `m` and sum `l` of every row.
pub struct RunningState {
    pub m: RowWise,
    pub l: RowWise,
}

impl RunningState {
    pub fn init(num_rows: usize) -> RunningState {
        RunningState {
            m: RowWise::new_min_value(num_rows),
            l: RowWise::new_zero(num_rows),
        }
    }
}

/// Partial reduction of a row by each lane, over the columns it holds.
///
/// Lanes holding no column keep `identity`.
pub fn workitem_reduce<F: Fn(f32, f32) -> f32>(
    row: &[f32],
    identity: f32,
    op: F,
) -> [f32; SUBGROUP_SIZE] {
    let mut lanes = [identity; SUBGROUP_SIZE];
    for (col, value) in row.iter().enumerate() {
        let lane = lane_of(col);
        lanes[lane] = op(lanes[lane], *value);
    }
    lanes
}

/// XOR butterfly across the lanes of a subgroup; every lane ends with the full reduction.
///
/// Every lane must take part, like the cross-lane permute it stands for.
pub fn subgroup_allreduce<F: Fn(f32, f32) -> f32>(lanes: &mut [f32; SUBGROUP_SIZE], op: F) {
    let mut mask = SUBGROUP_SIZE / 2;
    while mask >= 1 {
        let before = *lanes;
        for (lane, value) in lanes.iter_mut().enumerate() {
            *value = op(before[lane], before[lane ^ mask]);
        }
        mask /= 2;
    }
}

fn row_reduce<F: Fn(f32, f32) -> f32 + Copy>(row: &[f32], identity: f32, op: F) -> f32 {
    let mut lanes = workitem_reduce(row, identity, op);
    subgroup_allreduce(&mut lanes, op);
    lanes[0]
}

/// A fully masked row has a max of -inf; using 0 instead keeps `-inf - max` away from NaN.
fn guarded(max: f32) -> f32 {
    if max == f32::NEG_INFINITY { 0.0 } else { max }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Online softmax with the `log2(e)` factor folded in the scale, so exponentials are `exp2`.
pub struct OnlineSoftmax {
    scale: f32,
}

impl OnlineSoftmax {
    pub fn new(softmax_scale: f32) -> Self {
        Self {
            scale: softmax_scale * LOG2_E,
        }
    }

    /// Scale applied to `score - max` before `exp2`.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Turns one block of `scores` into probabilities and updates the running state.
    ///
    /// On any block but the first, `out` is rescaled to the new max of its row.
    pub fn run(
        &self,
        is_first: bool,
        scores: &mut Fragment<f32>,
        state: &mut RunningState,
        out: &mut Fragment<f32>,
    ) {
        debug_assert_eq!(scores.rows(), state.m.num_rows());

        if is_first {
            for row in 0..scores.rows() {
                state
                    .m
                    .replace_at(row, row_reduce(scores.row(row), f32::NEG_INFINITY, f32::max));
            }
        } else {
            let max_prev = state.m.clone();
            for row in 0..scores.rows() {
                let max = row_reduce(scores.row(row), max_prev.index(row), f32::max);
                state.m.replace_at(row, max);

                let curr_scale = ((max_prev.index(row) - guarded(max)) * self.scale).exp2();
                state.l.replace_at(row, state.l.index(row) * curr_scale);
                for value in out.row_mut(row) {
                    *value *= curr_scale;
                }
            }
        }

        self.scale_exp_log2(scores, &state.m);

        for row in 0..scores.rows() {
            let sum = row_reduce(scores.row(row), 0.0, |a, b| a + b);
            let l = match is_first {
                true => sum,
                false => state.l.index(row) + sum,
            };
            state.l.replace_at(row, l);
        }
    }

    fn scale_exp_log2(&self, scores: &mut Fragment<f32>, max: &RowWise) {
        for row in 0..scores.rows() {
            let max = guarded(max.index(row));
            for value in scores.row_mut(row) {
                *value = ((*value - max) * self.scale).exp2();
            }
        }
    }
}
