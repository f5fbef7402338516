use crate::components::{
    AccG, AccR, MatmulAvailabilityError, MatmulIdent, MatmulPrecision, MatmulSetupError,
    MatrixLayout, ProblemShape, SubgroupCoord, WorkgroupTiling,
    global::{barrier::SubgroupBarrier, copy::CopyPlan},
    tile::Fragment,
};

/// Writes the accumulator of one subgroup, after an optional fused operation.
///
/// The epilogue is the only component writing caller visible memory. Each subgroup stores its
/// own subgroup tile; reductions across subgroups go through the work-group
/// [shared storage](Epilogue::SharedStorage) and the barrier.
pub trait Epilogue<MP: MatmulPrecision>: Send + Sync {
    /// Scratch shared by the subgroups of one work-group.
    type SharedStorage: Default + Send + Sync;

    /// Checks the problem against the fused operation.
    fn can_implement(
        &self,
        problem: &ProblemShape,
        tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError>;

    /// Plan of the block stores of one subgroup tile.
    fn store_plan(&self, tiling: &WorkgroupTiling) -> Result<CopyPlan, MatmulSetupError> {
        let sg = tiling.subgroup_tile();
        CopyPlan::new::<AccG<MP>>(MatmulIdent::Out, MatrixLayout::RowMajor, sg.m, sg.n)
    }

    /// Every subgroup of the work-group must call `store`, since it may synchronize.
    fn store<B: SubgroupBarrier>(
        &self,
        acc: &Fragment<AccR<MP>>,
        coord: &SubgroupCoord,
        tiling: &WorkgroupTiling,
        shared: &Self::SharedStorage,
        barrier: &mut B,
    );
}

/// Epilogue combining the two accumulators of a dual GEMM.
pub trait DualEpilogue<MP: MatmulPrecision>: Send + Sync {
    fn can_implement(
        &self,
        problem: &ProblemShape,
        tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError>;

    fn store(
        &self,
        acc0: &Fragment<AccR<MP>>,
        acc1: &Fragment<AccR<MP>>,
        coord: &SubgroupCoord,
    );
}

/// Fails when the output does not have the shape of the problem.
pub fn check_output_shape(
    output: (usize, usize, usize),
    problem: &ProblemShape,
) -> Result<(), MatmulAvailabilityError> {
    let expected = problem.shape(MatmulIdent::Out);
    if output.0 < expected.0 || output.1 < expected.1 || output.2 < expected.2 {
        return Err(MatmulAvailabilityError::BufferTooSmall {
            ident: MatmulIdent::Out,
            len: output.0 * output.1 * output.2,
            required: expected.0 * expected.1 * expected.2,
        });
    }
    Ok(())
}
