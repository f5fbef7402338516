use cubecl_xe_matmul::components::{
    AccG, MatmulAvailabilityError, MatmulPrecision, Numeric, SubgroupCoord,
    epilogue::check_output_shape, global::memory::OutputTensor, tile::Fragment,
};

use crate::components::{AttentionProblem, softmax::RunningState};

/// Normalizes the output rows by their softmax sum and stores them.
pub struct AttentionEpilogue<'a, MP: MatmulPrecision> {
    output: OutputTensor<'a, AccG<MP>>,
}

impl<'a, MP: MatmulPrecision> AttentionEpilogue<'a, MP> {
    pub fn new(output: OutputTensor<'a, AccG<MP>>) -> Self {
        Self { output }
    }

    pub fn can_implement(&self, problem: &AttentionProblem) -> Result<(), MatmulAvailabilityError> {
        check_output_shape(self.output.shape(), &problem.value_problem().shape)
    }

    /// Every subgroup stores the `(SG_M, val_dim)` rows it owns.
    pub fn store(&self, out: &Fragment<f32>, state: &RunningState, coord: &SubgroupCoord) {
        let normalized = Fragment::from_fn(out.rows(), out.cols(), |row, col| {
            let sum = state.l.index(row);
            let scale = if sum == 0.0 || !sum.is_finite() {
                1.0
            } else {
                sum.recip()
            };
            AccG::<MP>::from_f32(out.get(row, col) * scale)
        });

        self.output.store(&normalized, coord.m, 0, coord.l);
    }
}
