use cubecl_xe_matmul::{
    components::{
        AccG, LhsG, MatmulPrecision, RhsG,
        global::{
            MainloopSelection,
            listener::NoEvent,
            memory::{OperandArguments, OutputTensor},
            prefetch::{CacheLinePrefetcher, NoPrefetch},
        },
    },
    config::XeConfig,
    kernels::workgroup::LaunchReport,
};

use crate::{
    components::{AttentionProblem, AttentionSetupError, epilogue::AttentionEpilogue},
    kernels::flash::FlashAttentionKernel,
};

/// Computes `out = softmax(scale · Q·Kᵗ)·V` for every head.
///
/// Every tensor is packed as described on [AttentionProblem]. `scale` defaults to
/// `1/sqrt(head_dim)`.
pub fn launch<MP: MatmulPrecision>(
    problem: &AttentionProblem,
    selection: &MainloopSelection,
    scale: Option<f32>,
    query: &[LhsG<MP>],
    key: &[RhsG<MP>],
    value: &[RhsG<MP>],
    out: &mut [AccG<MP>],
) -> Result<LaunchReport, AttentionSetupError> {
    let mut kernel = FlashAttentionKernel::<MP>::setup(problem, selection)?;
    if let Some(scale) = scale {
        kernel = kernel.with_scale(scale);
    }

    let views = kernel.to_underlying_arguments(
        OperandArguments::new(query, problem.query_strides()),
        OperandArguments::new(key, problem.key_strides()),
        OperandArguments::new(value, problem.value_strides()),
    )?;
    let output = OutputTensor::new(out, problem.out_shape(), problem.out_strides())?;
    let epilogue = AttentionEpilogue::<MP>::new(output);

    match XeConfig::get().kernel.prefetch {
        true => kernel.launch::<CacheLinePrefetcher, NoEvent>(&views, &epilogue),
        false => kernel.launch::<NoPrefetch, NoEvent>(&views, &epilogue),
    }
}
