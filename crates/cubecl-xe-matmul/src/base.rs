use crate::{
    components::{
        AccG, LhsG, MatmulIdent, MatmulPrecision, MatmulProblem, MatmulSetupError, RhsG,
        epilogue::LinearCombination,
        global::{
            MainloopFamily, MainloopSelection, MixedInputMainloopFamily, PipelinedMainloopFamily,
            UnpredicatedMainloopFamily,
            listener::NoEvent,
            memory::{OperandArguments, OutputTensor, Strides},
            prefetch::{CacheLinePrefetcher, NoPrefetch},
        },
    },
    config::XeConfig,
    kernels::{gemm::GemmKernel, streamk::StreamKKernel, workgroup::LaunchReport},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// The GEMM mainloop to launch
pub enum Strategy {
    /// Single pass, subgroup scoped prefetch and no barrier. Row major operands only.
    Unpredicated,
    #[default]
    /// Multi-stage with work-group scoped prefetch and a barrier per K tile.
    Pipelined,
    /// Operands converted to their register type after each copy.
    MixedInput,
    /// Pipelined mainloop with the K range of each tile split in `splits` units.
    StreamK { splits: usize },
}

/// Computes `out = lhs · rhs` with the selected strategy.
///
/// `out` is a packed row-major `(M, N, L)` tensor. Prefetching follows
/// [the kernel config](crate::config::kernel::KernelConfig::prefetch).
pub fn launch<MP: MatmulPrecision>(
    strategy: &Strategy,
    problem: &MatmulProblem,
    selection: &MainloopSelection,
    lhs: OperandArguments<'_, LhsG<MP>>,
    rhs: OperandArguments<'_, RhsG<MP>>,
    out: &mut [AccG<MP>],
) -> Result<LaunchReport, MatmulSetupError> {
    let (rows, cols, batch) = problem.shape.shape(MatmulIdent::Out);
    let out = OutputTensor::new(out, (rows, cols, batch), Strides::row_major(rows, cols))?;
    let epilogue = LinearCombination::<MP>::new(out);
    let prefetch = XeConfig::get().kernel.prefetch;

    match strategy {
        Strategy::Unpredicated => launch_gemm::<MP, UnpredicatedMainloopFamily>(
            problem, selection, lhs, rhs, &epilogue, prefetch,
        ),
        Strategy::Pipelined => launch_gemm::<MP, PipelinedMainloopFamily>(
            problem, selection, lhs, rhs, &epilogue, prefetch,
        ),
        Strategy::MixedInput => launch_gemm::<MP, MixedInputMainloopFamily>(
            problem, selection, lhs, rhs, &epilogue, prefetch,
        ),
        Strategy::StreamK { splits } => {
            let kernel =
                StreamKKernel::<PipelinedMainloopFamily, MP>::setup(problem, selection, *splits)?;
            let views = kernel.to_underlying_arguments(lhs, rhs)?;
            match prefetch {
                true => kernel.launch::<CacheLinePrefetcher, NoEvent, _>(&views, &epilogue),
                false => kernel.launch::<NoPrefetch, NoEvent, _>(&views, &epilogue),
            }
        }
    }
}

fn launch_gemm<MP: MatmulPrecision, MF: MainloopFamily>(
    problem: &MatmulProblem,
    selection: &MainloopSelection,
    lhs: OperandArguments<'_, LhsG<MP>>,
    rhs: OperandArguments<'_, RhsG<MP>>,
    epilogue: &LinearCombination<'_, MP>,
    prefetch: bool,
) -> Result<LaunchReport, MatmulSetupError> {
    let kernel = GemmKernel::<MF, MP>::setup(problem, selection)?;
    let views = kernel.to_underlying_arguments(lhs, rhs)?;

    match prefetch {
        true => kernel.launch::<CacheLinePrefetcher, NoEvent, _>(&views, epilogue),
        false => kernel.launch::<NoPrefetch, NoEvent, _>(&views, epilogue),
    }
}
