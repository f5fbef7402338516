use std::collections::BTreeSet;

use half::bf16;
use pretty_assertions::assert_eq;

use crate::{
    Strategy,
    components::{
        AccG, LhsG, MatmulAvailabilityError, MatmulIdent, MatmulPrecision, MatmulProblem,
        MatmulSetupError, MatrixLayout, OperandStream, ProblemShape, RhsG, TileShape,
        WorkgroupCoord, WorkgroupTiling, i4,
        epilogue::{Activation, DualEpilogue, DualGatedCombination, LinearCombination, RowSoftmax},
        global::{
            GroupedOperands, KTileRange, MainloopFamily, MainloopSelection,
            MixedInputMainloopFamily, PipelinedMainloopFamily, UnpredicatedMainloopFamily,
            listener::{MainloopEvent, NoEvent},
            memory::{OperandArguments, OutputTensor, Strides},
            prefetch::{CacheLinePrefetcher, NoPrefetch, Prefetcher},
        },
        tile::Fragment,
        tiling::SubgroupArrangement,
    },
    kernels::{
        dual::DualGemmKernel, gemm::GemmKernel, grouped::GroupedGemmKernel,
        streamk::StreamKKernel, workgroup::LaunchReport,
    },
    tests::{
        naive::{gemm_reference, softmax_reference},
        test_utils::{assert_equals_approx, random_data, to_f32},
    },
};

type MixedI4 = ((bf16, bf16), (i4, bf16), (f32, f32));
type MixedI8 = ((bf16, bf16), (i8, bf16), (f32, f32));

fn selection(stages: usize) -> MainloopSelection {
    MainloopSelection::builder(TileShape::new(32, 64, 32), SubgroupArrangement::new(2, 2, 1))
        .stages(stages)
        .build()
}

fn operand<'a, E>(
    data: &'a [E],
    problem: &MatmulProblem,
    ident: MatmulIdent,
) -> OperandArguments<'a, E> {
    let (rows, cols, _) = problem.shape.shape(ident);
    OperandArguments::new(data, Strides::packed(problem.layout(ident), rows, cols))
}

fn output<E: crate::components::Numeric>(
    data: &mut [E],
    shape: ProblemShape,
) -> OutputTensor<'_, E> {
    OutputTensor::new(
        data,
        (shape.m, shape.n, shape.l),
        Strides::row_major(shape.m, shape.n),
    )
    .unwrap()
}

fn inputs<MP: MatmulPrecision>(
    problem: &MatmulProblem,
    seed: u64,
    rhs_range: f32,
) -> (Vec<LhsG<MP>>, Vec<RhsG<MP>>) {
    let shape = problem.shape;
    (
        random_data(shape.m * shape.k * shape.l, seed, -1.0, 1.0),
        random_data(shape.k * shape.n * shape.l, seed + 1, -rhs_range, rhs_range),
    )
}

fn run_gemm<MF: MainloopFamily, MP: MatmulPrecision, P: Prefetcher + Default>(
    problem: &MatmulProblem,
    selection: &MainloopSelection,
    lhs: &[LhsG<MP>],
    rhs: &[RhsG<MP>],
) -> (Vec<AccG<MP>>, LaunchReport) {
    let shape = problem.shape;
    let mut out = vec![AccG::<MP>::default(); shape.m * shape.n * shape.l];

    let kernel = GemmKernel::<MF, MP>::setup(problem, selection).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(lhs, problem, MatmulIdent::Lhs),
            operand(rhs, problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = LinearCombination::<MP>::new(output(&mut out, shape));
    let report = kernel.launch::<P, NoEvent, _>(&views, &epilogue).unwrap();
    drop(epilogue);

    (out, report)
}

fn check_against_reference<MF: MainloopFamily, MP: MatmulPrecision>(
    problem: &MatmulProblem,
    rhs_range: f32,
    epsilon: f32,
) {
    let (lhs, rhs) = inputs::<MP>(problem, 7, rhs_range);
    let (out, _) = run_gemm::<MF, MP, CacheLinePrefetcher>(problem, &selection(3), &lhs, &rhs);
    let expected = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), problem);

    if let Err(message) = assert_equals_approx(&out, &expected, epsilon) {
        panic!("{message}");
    }
}

#[test]
fn subgroup_tiles_cover_the_output_exactly_once() {
    for (tile, atoms) in [
        ((32, 64, 32), (2, 2, 1)),
        ((256, 256, 32), (8, 4, 1)),
        ((64, 32, 16), (4, 1, 1)),
        ((16, 16, 16), (1, 1, 1)),
    ] {
        let tiling = WorkgroupTiling::new(
            TileShape::new(tile.0, tile.1, tile.2),
            SubgroupArrangement::new(atoms.0, atoms.1, atoms.2),
        )
        .unwrap();
        let sg = tiling.subgroup_tile();

        for shape in [
            ProblemShape::new(70, 96, 8, 1),
            ProblemShape::new(1, 1, 1, 2),
            ProblemShape::new(300, 17, 8, 3),
        ] {
            let mut hits = vec![0u32; shape.m * shape.n * shape.l];

            for workgroup in tiling.workgroups(&shape) {
                for id in 0..tiling.num_subgroups() {
                    let coord = tiling.subgroup_coord(&workgroup, id);
                    for row in coord.m..(coord.m + sg.m).min(shape.m) {
                        for col in coord.n..(coord.n + sg.n).min(shape.n) {
                            hits[coord.l * shape.m * shape.n + row * shape.n + col] += 1;
                        }
                    }
                }
            }

            assert!(
                hits.iter().all(|hits| *hits == 1),
                "tile {tile:?} atoms {atoms:?} shape {shape:?}"
            );
        }
    }
}

#[test]
fn pipelined_bf16_matches_reference() {
    check_against_reference::<PipelinedMainloopFamily, bf16>(
        &MatmulProblem::gemm(70, 96, 80),
        1.0,
        1e-3,
    );
}

#[test]
fn pipelined_handles_column_major_operands() {
    let problem = MatmulProblem::gemm(70, 96, 80)
        .with_layouts(MatrixLayout::ColMajor, MatrixLayout::ColMajor);

    check_against_reference::<PipelinedMainloopFamily, bf16>(&problem, 1.0, 1e-3);
}

#[test]
fn pipelined_batched_matches_reference() {
    check_against_reference::<PipelinedMainloopFamily, bf16>(
        &MatmulProblem::batched(40, 64, 64, 3),
        1.0,
        1e-3,
    );
}

#[test]
fn pipelined_f32_matches_reference() {
    check_against_reference::<PipelinedMainloopFamily, f32>(
        &MatmulProblem::gemm(33, 70, 45),
        1.0,
        1e-4,
    );
}

#[test]
fn integer_accumulation_is_exact() {
    let problem = MatmulProblem::gemm(70, 96, 80);
    let shape = problem.shape;
    let lhs: Vec<i8> = random_data(shape.m * shape.k, 3, -100.0, 100.0);
    let rhs: Vec<i8> = random_data(shape.k * shape.n, 4, -100.0, 100.0);

    let (out, _) =
        run_gemm::<PipelinedMainloopFamily, i8, NoPrefetch>(&problem, &selection(2), &lhs, &rhs);
    let expected = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem);

    let out: Vec<f32> = out.iter().map(|value| *value as f32).collect();
    assert_eq!(out, expected);
}

#[test]
fn integer_accumulation_is_exact_past_f32_precision() {
    let problem = MatmulProblem::gemm(32, 64, 2048);
    let shape = problem.shape;
    let mut lhs = vec![127i8; shape.m * shape.k];
    lhs[0] = 126;
    let rhs = vec![127i8; shape.k * shape.n];

    let expected: Vec<i32> = (0..shape.m * shape.n)
        .map(|index| {
            let (row, col) = (index / shape.n, index % shape.n);
            (0..shape.k)
                .map(|k| lhs[row * shape.k + k] as i64 * rhs[k * shape.n + col] as i64)
                .sum::<i64>() as i32
        })
        .collect();
    assert_eq!(expected[0], 33_032_065);

    for strategy in [
        Strategy::Unpredicated,
        Strategy::Pipelined,
        Strategy::MixedInput,
        Strategy::StreamK { splits: 4 },
    ] {
        let mut out = vec![0i32; shape.m * shape.n];
        crate::launch::<i8>(
            &strategy,
            &problem,
            &selection(2),
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs, &problem, MatmulIdent::Rhs),
            &mut out,
        )
        .unwrap();

        assert_eq!(out[0], 33_032_065, "{strategy:?}");
        assert_eq!(out, expected, "{strategy:?}");
    }
}

#[test]
fn unpredicated_matches_reference() {
    check_against_reference::<UnpredicatedMainloopFamily, bf16>(
        &MatmulProblem::gemm(64, 128, 96),
        1.0,
        1e-3,
    );
}

#[test]
fn mixed_input_i4_matches_reference() {
    check_against_reference::<MixedInputMainloopFamily, MixedI4>(
        &MatmulProblem::gemm(70, 96, 80),
        8.0,
        1e-3,
    );
}

#[test]
fn mixed_input_i8_matches_reference() {
    check_against_reference::<MixedInputMainloopFamily, MixedI8>(
        &MatmulProblem::gemm(40, 64, 64),
        100.0,
        1e-3,
    );
}

#[test]
fn prefetching_never_changes_the_result() {
    let problem = MatmulProblem::gemm(70, 96, 160);
    let (lhs, rhs) = inputs::<bf16>(&problem, 11, 1.0);

    let (without, no_report) =
        run_gemm::<PipelinedMainloopFamily, bf16, NoPrefetch>(&problem, &selection(3), &lhs, &rhs);
    let (with, report) = run_gemm::<PipelinedMainloopFamily, bf16, CacheLinePrefetcher>(
        &problem,
        &selection(3),
        &lhs,
        &rhs,
    );

    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&without), bits(&with));
    assert_eq!(no_report.prefetches, 0);
    assert!(report.prefetches > 0);
    assert_eq!(report.workgroups, no_report.workgroups);
}

#[test]
fn pipeline_depth_never_changes_the_result() {
    let problem = MatmulProblem::gemm(40, 64, 160);
    let (lhs, rhs) = inputs::<bf16>(&problem, 5, 1.0);

    let (shallow, _) = run_gemm::<PipelinedMainloopFamily, bf16, CacheLinePrefetcher>(
        &problem,
        &selection(1),
        &lhs,
        &rhs,
    );
    let (deep, _) = run_gemm::<PipelinedMainloopFamily, bf16, CacheLinePrefetcher>(
        &problem,
        &selection(8),
        &lhs,
        &rhs,
    );

    assert_eq!(shallow, deep);
}

fn traced_events<MF: MainloopFamily>(problem: &MatmulProblem) -> Vec<Vec<MainloopEvent>> {
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(problem, 1, 1.0);
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel = GemmKernel::<MF, bf16>::setup(problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(&lhs, problem, MatmulIdent::Lhs),
            operand(&rhs, problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = LinearCombination::<bf16>::new(output(&mut out, shape));
    let k_tiles = KTileRange::full(shape.k_tiles(32));

    kernel
        .run_workgroup::<NoPrefetch, Vec<MainloopEvent>, _>(
            &views,
            &epilogue,
            &WorkgroupCoord::default(),
            k_tiles,
        )
        .into_iter()
        .map(|outcome| outcome.listener)
        .collect()
}

#[test]
fn pipelined_events_follow_the_schedule() {
    use MainloopEvent::*;
    use MatmulIdent::{Lhs, Rhs};
    const P: OperandStream = OperandStream::Primary;

    let traces = traced_events::<PipelinedMainloopFamily>(&MatmulProblem::gemm(32, 64, 128));

    let mut expected = vec![
        Prefetch { ident: Lhs, stream: P, k_tile: 0 },
        Prefetch { ident: Rhs, stream: P, k_tile: 0 },
        Prefetch { ident: Lhs, stream: P, k_tile: 1 },
        Prefetch { ident: Rhs, stream: P, k_tile: 1 },
    ];
    for k_tile in 0..4 {
        expected.push(BarrierArrive { k_tile });
        expected.push(Load { ident: Lhs, stream: P, k_tile });
        expected.push(Load { ident: Rhs, stream: P, k_tile });
        if k_tile + 2 < 4 {
            expected.push(Prefetch { ident: Lhs, stream: P, k_tile: k_tile + 2 });
            expected.push(Prefetch { ident: Rhs, stream: P, k_tile: k_tile + 2 });
        }
        expected.push(Mma { stream: P, k_tile });
        expected.push(BarrierWait { k_tile });
    }

    assert_eq!(traces.len(), 4);
    for trace in traces {
        assert_eq!(trace, expected);
    }
}

#[test]
fn unpredicated_never_synchronizes() {
    let traces = traced_events::<UnpredicatedMainloopFamily>(&MatmulProblem::gemm(32, 64, 96));

    for trace in traces {
        assert!(!trace.iter().any(|event| matches!(
            event,
            MainloopEvent::BarrierArrive { .. } | MainloopEvent::BarrierWait { .. }
        )));
        let mmas: Vec<_> = trace
            .iter()
            .filter_map(|event| match event {
                MainloopEvent::Mma { k_tile, .. } => Some(*k_tile),
                _ => None,
            })
            .collect();
        assert_eq!(mmas, vec![0, 1, 2]);
        assert!(trace.iter().all(|event| match event {
            MainloopEvent::Prefetch { k_tile, .. } => *k_tile < 3,
            _ => true,
        }));
    }
}

#[test]
fn unpredicated_rejects_column_major_operands() {
    let problem = MatmulProblem::gemm(64, 64, 64)
        .with_layouts(MatrixLayout::ColMajor, MatrixLayout::RowMajor);

    let result = GemmKernel::<UnpredicatedMainloopFamily, bf16>::setup(&problem, &selection(2));

    assert!(matches!(result, Err(MatmulSetupError::InvalidConfig(_))));
}

#[test]
fn pipelined_rejects_converting_precisions() {
    let result = GemmKernel::<PipelinedMainloopFamily, MixedI4>::setup(
        &MatmulProblem::gemm(64, 64, 64),
        &selection(2),
    );

    assert!(matches!(result, Err(MatmulSetupError::InvalidConfig(_))));
}

#[test]
fn stream_k_matches_reference() {
    let problem = MatmulProblem::gemm(70, 96, 160);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 13, 1.0);
    let expected = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem);

    for splits in [1, 2, 3, 5] {
        let mut out = vec![0.0f32; shape.m * shape.n];
        let kernel =
            StreamKKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2), splits)
                .unwrap();
        let views = kernel
            .to_underlying_arguments(
                operand(&lhs, &problem, MatmulIdent::Lhs),
                operand(&rhs, &problem, MatmulIdent::Rhs),
            )
            .unwrap();
        let epilogue = LinearCombination::<bf16>::new(output(&mut out, shape));
        kernel
            .launch::<NoPrefetch, NoEvent, _>(&views, &epilogue)
            .unwrap();
        drop(epilogue);

        if let Err(message) = assert_equals_approx(&out, &expected, 1e-3) {
            panic!("splits {splits}: {message}");
        }
    }
}

#[test]
fn stream_k_units_partition_the_k_range() {
    let problem = MatmulProblem::gemm(70, 96, 160);
    let kernel =
        StreamKKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2), 3).unwrap();

    let units = kernel.units();
    assert_eq!(units.len(), 6 * 3);

    for tile in 0..6 {
        let ranges: Vec<_> = units
            .iter()
            .filter(|unit| unit.tile == tile)
            .map(|unit| (unit.k_tiles.start, unit.k_tiles.count))
            .collect();
        assert_eq!(ranges, vec![(0, 1), (1, 2), (3, 2)]);
    }
}

#[test]
fn stream_k_rejects_impossible_splits() {
    let problem = MatmulProblem::gemm(64, 64, 64);

    for splits in [0, 3] {
        let result =
            StreamKKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2), splits);
        assert!(matches!(
            result,
            Err(MatmulSetupError::Unavailable(MatmulAvailabilityError::InvalidSplit {
                k_tiles: 2,
                ..
            }))
        ));
    }
}

#[test]
fn linear_combination_applies_alpha_beta_and_activation() {
    let problem = MatmulProblem::gemm(40, 64, 64);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 17, 1.0);
    let source: Vec<f32> = random_data(shape.m * shape.n, 19, -1.0, 1.0);
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel =
        GemmKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs, &problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let source_view = crate::components::global::memory::TensorView::new(
        MatmulIdent::Out,
        OperandArguments::new(&source, Strides::row_major(shape.m, shape.n)),
        (shape.m, shape.n, 1),
        MatrixLayout::RowMajor,
    )
    .unwrap();
    let epilogue = LinearCombination::<bf16>::new(output(&mut out, shape))
        .with_alpha(0.5)
        .with_source(source_view, 2.0)
        .with_activation(Activation::Relu);
    kernel
        .launch::<NoPrefetch, NoEvent, _>(&views, &epilogue)
        .unwrap();
    drop(epilogue);

    let expected: Vec<f32> = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem)
        .iter()
        .zip(source.iter())
        .map(|(acc, c)| (0.5 * acc + 2.0 * c).max(0.0))
        .collect();
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-3) {
        panic!("{message}");
    }
}

#[test]
fn row_softmax_normalizes_whole_rows() {
    let problem = MatmulProblem::gemm(40, 48, 64);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 23, 1.0);
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel =
        GemmKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs, &problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = RowSoftmax::<bf16>::new(output(&mut out, shape));
    kernel
        .launch::<NoPrefetch, NoEvent, _>(&views, &epilogue)
        .unwrap();
    drop(epilogue);

    let logits = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem);
    let expected = softmax_reference(&logits, shape.m, shape.n);
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-4) {
        panic!("{message}");
    }
    for row in out.chunks(shape.n) {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }
}

fn run_row_softmax(
    problem: &MatmulProblem,
    lhs: &[bf16],
    rhs: &[bf16],
    source: &[f32],
    activation: Activation,
) -> Vec<f32> {
    let shape = problem.shape;
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel =
        GemmKernel::<PipelinedMainloopFamily, bf16>::setup(problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(lhs, problem, MatmulIdent::Lhs),
            operand(rhs, problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let source_view = crate::components::global::memory::TensorView::new(
        MatmulIdent::Out,
        OperandArguments::new(source, Strides::row_major(shape.m, shape.n)),
        (shape.m, shape.n, 1),
        MatrixLayout::RowMajor,
    )
    .unwrap();
    let combination = LinearCombination::<bf16>::new(output(&mut out, shape))
        .with_alpha(2.0)
        .with_source(source_view, 1.0)
        .with_activation(activation);
    let epilogue = RowSoftmax::with_combination(combination);
    kernel
        .launch::<NoPrefetch, NoEvent, _>(&views, &epilogue)
        .unwrap();
    drop(epilogue);

    out
}

#[test]
fn row_softmax_applies_the_activation_before_normalizing() {
    let problem = MatmulProblem::gemm(40, 48, 64);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 29, 1.0);
    let mut source = vec![0.0f32; shape.m * shape.n];
    source[3 * shape.n..4 * shape.n].fill(f32::NEG_INFINITY);

    let out = run_row_softmax(&problem, &lhs, &rhs, &source, Activation::Relu);

    let logits: Vec<f32> = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem)
        .iter()
        .zip(source.iter())
        .map(|(acc, c)| (2.0 * acc + c).max(0.0))
        .collect();
    let expected = softmax_reference(&logits, shape.m, shape.n);
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-4) {
        panic!("{message}");
    }
    // relu lifts the masked row to zeros, which normalize to a uniform row
    let uniform = 1.0 / shape.n as f32;
    assert!(out[3 * shape.n..4 * shape.n].iter().all(|p| (p - uniform).abs() < 1e-6));
}

#[test]
fn row_softmax_stores_zeros_for_fully_masked_rows() {
    let problem = MatmulProblem::gemm(40, 48, 64);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 31, 1.0);
    let mut source = vec![0.0f32; shape.m * shape.n];
    source[3 * shape.n..4 * shape.n].fill(f32::NEG_INFINITY);

    let out = run_row_softmax(&problem, &lhs, &rhs, &source, Activation::Identity);

    for (row, values) in out.chunks(shape.n).enumerate() {
        assert!(values.iter().all(|p| p.is_finite()), "row {row}");
        match row == 3 {
            true => assert!(values.iter().all(|p| *p == 0.0)),
            false => assert!((values.iter().sum::<f32>() - 1.0).abs() < 1e-4, "row {row}"),
        }
    }
}

#[test]
fn row_softmax_rejects_rows_wider_than_a_tile() {
    let problem = MatmulProblem::gemm(40, 96, 64);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 23, 1.0);
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel =
        GemmKernel::<PipelinedMainloopFamily, bf16>::setup(&problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs, &problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = RowSoftmax::<bf16>::new(output(&mut out, shape));

    let result = kernel.launch::<NoPrefetch, NoEvent, _>(&views, &epilogue);

    assert!(matches!(
        result,
        Err(MatmulSetupError::Unavailable(MatmulAvailabilityError::RowTooWide {
            n: 96,
            tile_n: 64
        }))
    ));
}

/// Packs the operands of every group in one buffer, each followed by NaN sentinels.
fn pack_with_sentinels(parts: &[Vec<bf16>], padding: usize) -> (Vec<bf16>, Vec<usize>) {
    let mut buffer = Vec::new();
    let mut offsets = Vec::new();
    for part in parts {
        offsets.push(buffer.len());
        buffer.extend_from_slice(part);
        buffer.extend(std::iter::repeat_n(bf16::NAN, padding));
    }
    (buffer, offsets)
}

#[test]
fn grouped_gemm_stays_inside_each_group() {
    let problems = vec![
        ProblemShape::gemm(40, 64, 64),
        ProblemShape::gemm(70, 32, 96),
        ProblemShape::gemm(16, 96, 32),
    ];
    let lhs_parts: Vec<Vec<bf16>> = problems
        .iter()
        .enumerate()
        .map(|(g, p)| random_data(p.m * p.k, 100 + g as u64, -1.0, 1.0))
        .collect();
    let rhs_parts: Vec<Vec<bf16>> = problems
        .iter()
        .enumerate()
        .map(|(g, p)| random_data(p.k * p.n, 200 + g as u64, -1.0, 1.0))
        .collect();
    let (lhs_all, lhs_offsets) = pack_with_sentinels(&lhs_parts, 257);
    let (rhs_all, rhs_offsets) = pack_with_sentinels(&rhs_parts, 257);

    let operands = GroupedOperands::new(
        problems.clone(),
        problems
            .iter()
            .zip(&lhs_offsets)
            .map(|(p, offset)| OperandArguments::new(&lhs_all[*offset..], Strides::row_major(p.m, p.k)))
            .collect(),
        problems
            .iter()
            .zip(&rhs_offsets)
            .map(|(p, offset)| OperandArguments::new(&rhs_all[*offset..], Strides::row_major(p.k, p.n)))
            .collect(),
        MatrixLayout::RowMajor,
        MatrixLayout::RowMajor,
    )
    .unwrap();

    let mut outs: Vec<Vec<f32>> = problems.iter().map(|p| vec![0.0; p.m * p.n]).collect();
    let kernel = GroupedGemmKernel::<bf16>::setup(
        &problems,
        MatrixLayout::RowMajor,
        MatrixLayout::RowMajor,
        &selection(2),
        2,
    )
    .unwrap();
    let epilogues: Vec<_> = outs
        .iter_mut()
        .zip(&problems)
        .map(|(out, p)| LinearCombination::<bf16>::new(output(out, *p)))
        .collect();

    let traces = kernel
        .launch_traced::<CacheLinePrefetcher, Vec<MainloopEvent>, _>(&operands, &epilogues)
        .unwrap();
    drop(epilogues);

    for g in 0..problems.len() {
        let problem = operands.problem(g);
        let expected = gemm_reference(&to_f32(&lhs_parts[g]), &to_f32(&rhs_parts[g]), &problem);
        assert!(outs[g].iter().all(|value| value.is_finite()), "group {g}");
        if let Err(message) = assert_equals_approx(&outs[g], &expected, 1e-3) {
            panic!("group {g}: {message}");
        }
    }

    assert_eq!(traces.len(), 2);
    for (worker, (_, listeners)) in traces.iter().enumerate() {
        let groups: Vec<usize> = kernel
            .units_of(worker)
            .iter()
            .map(|unit| unit.group)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for trace in listeners {
            let switches: Vec<usize> = trace
                .iter()
                .filter_map(|event| match event {
                    MainloopEvent::GroupSwitch { group } => Some(*group),
                    _ => None,
                })
                .collect();
            assert_eq!(switches, groups, "worker {worker}");
        }
    }
}

#[test]
fn grouped_gemm_checks_group_counts() {
    let problems = vec![ProblemShape::gemm(32, 64, 32), ProblemShape::gemm(32, 64, 32)];
    let lhs: Vec<bf16> = random_data(32 * 32, 1, -1.0, 1.0);
    let rhs: Vec<bf16> = random_data(32 * 64, 2, -1.0, 1.0);
    let args = |_: usize| {
        (
            OperandArguments::new(lhs.as_slice(), Strides::row_major(32, 32)),
            OperandArguments::new(rhs.as_slice(), Strides::row_major(32, 64)),
        )
    };
    let (lhs_args, rhs_args): (Vec<_>, Vec<_>) = (0..2).map(args).unzip();
    let operands = GroupedOperands::new(
        problems.clone(),
        lhs_args,
        rhs_args,
        MatrixLayout::RowMajor,
        MatrixLayout::RowMajor,
    )
    .unwrap();

    let mut out = vec![0.0f32; 32 * 64];
    let kernel = GroupedGemmKernel::<bf16>::setup(
        &problems,
        MatrixLayout::RowMajor,
        MatrixLayout::RowMajor,
        &selection(2),
        4,
    )
    .unwrap();
    let epilogues = vec![LinearCombination::<bf16>::new(output(&mut out, problems[0]))];

    let result = kernel.launch::<NoPrefetch, NoEvent, _>(&operands, &epilogues);

    assert!(matches!(
        result,
        Err(MatmulSetupError::Unavailable(MatmulAvailabilityError::GroupCountMismatch {
            groups: 2,
            got: 1
        }))
    ));
}

/// Stores both accumulators untouched.
struct SplitAccumulators<'a> {
    acc0: OutputTensor<'a, f32>,
    acc1: OutputTensor<'a, f32>,
}

impl DualEpilogue<bf16> for SplitAccumulators<'_> {
    fn can_implement(
        &self,
        _problem: &ProblemShape,
        _tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError> {
        Ok(())
    }

    fn store(
        &self,
        acc0: &Fragment<f32>,
        acc1: &Fragment<f32>,
        coord: &crate::components::SubgroupCoord,
    ) {
        self.acc0.store(acc0, coord.m, coord.n, coord.l);
        self.acc1.store(acc1, coord.m, coord.n, coord.l);
    }
}

fn run_dual(
    problem: &MatmulProblem,
    lhs: &[bf16],
    rhs0: &[bf16],
    rhs1: &[bf16],
) -> (Vec<f32>, Vec<f32>) {
    let shape = problem.shape;
    let mut acc0 = vec![0.0f32; shape.m * shape.n];
    let mut acc1 = vec![0.0f32; shape.m * shape.n];

    let kernel = DualGemmKernel::<bf16>::setup(problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(lhs, problem, MatmulIdent::Lhs),
            operand(rhs0, problem, MatmulIdent::Rhs),
            operand(rhs1, problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = SplitAccumulators {
        acc0: output(&mut acc0, shape),
        acc1: output(&mut acc1, shape),
    };
    kernel
        .launch::<CacheLinePrefetcher, NoEvent, _>(&views, &epilogue)
        .unwrap();
    drop(epilogue);

    (acc0, acc1)
}

#[test]
fn dual_gemm_shares_the_lhs_stream() {
    let problem = MatmulProblem::gemm(40, 64, 96);
    let shape = problem.shape;
    let (lhs, rhs0) = inputs::<bf16>(&problem, 31, 1.0);
    let rhs1: Vec<bf16> = rhs0
        .iter()
        .map(|value| bf16::from_f32(value.to_f32() * 2.0))
        .collect();

    let corrupted_row = 17;
    let mut corrupted = lhs.clone();
    for k in 0..shape.k {
        corrupted[corrupted_row * shape.k + k] = bf16::from_f32(8.0);
    }

    let (clean0, clean1) = run_dual(&problem, &lhs, &rhs0, &rhs1);
    let (dirty0, dirty1) = run_dual(&problem, &corrupted, &rhs0, &rhs1);

    for (acc0, acc1) in [(&clean0, &clean1), (&dirty0, &dirty1)] {
        let doubled: Vec<f32> = acc0.iter().map(|value| value * 2.0).collect();
        assert_eq!(&doubled, acc1);
    }

    let changed_rows = |clean: &[f32], dirty: &[f32]| {
        (0..shape.m)
            .filter(|row| {
                let range = row * shape.n..(row + 1) * shape.n;
                clean[range.clone()] != dirty[range]
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(changed_rows(&clean0, &dirty0), vec![corrupted_row]);
    assert_eq!(changed_rows(&clean1, &dirty1), vec![corrupted_row]);
}

#[test]
fn dual_gated_combination_matches_reference() {
    let problem = MatmulProblem::gemm(40, 64, 96);
    let shape = problem.shape;
    let (lhs, rhs0) = inputs::<bf16>(&problem, 41, 1.0);
    let rhs1: Vec<bf16> = random_data(shape.k * shape.n, 43, -1.0, 1.0);
    let mut out = vec![0.0f32; shape.m * shape.n];

    let kernel = DualGemmKernel::<bf16>::setup(&problem, &selection(2)).unwrap();
    let views = kernel
        .to_underlying_arguments(
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs0, &problem, MatmulIdent::Rhs),
            operand(&rhs1, &problem, MatmulIdent::Rhs),
        )
        .unwrap();
    let epilogue = DualGatedCombination::<bf16>::new(output(&mut out, shape), Activation::Silu);
    kernel
        .launch::<NoPrefetch, NoEvent, _>(&views, &epilogue)
        .unwrap();
    drop(epilogue);

    let lhs = to_f32(&lhs);
    let gate = gemm_reference(&lhs, &to_f32(&rhs0), &problem);
    let up = gemm_reference(&lhs, &to_f32(&rhs1), &problem);
    let expected: Vec<f32> = gate
        .iter()
        .zip(up.iter())
        .map(|(gate, up)| (Activation::Silu.apply(*gate as f64) * *up as f64) as f32)
        .collect();
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-3) {
        panic!("{message}");
    }
}

#[test]
fn launch_dispatches_every_strategy() {
    let problem = MatmulProblem::gemm(64, 64, 96);
    let shape = problem.shape;
    let (lhs, rhs) = inputs::<bf16>(&problem, 47, 1.0);
    let expected = gemm_reference(&to_f32(&lhs), &to_f32(&rhs), &problem);

    for strategy in [
        Strategy::Unpredicated,
        Strategy::Pipelined,
        Strategy::MixedInput,
        Strategy::StreamK { splits: 2 },
    ] {
        let mut out = vec![0.0f32; shape.m * shape.n];
        let report = crate::launch::<bf16>(
            &strategy,
            &problem,
            &selection(2),
            operand(&lhs, &problem, MatmulIdent::Lhs),
            operand(&rhs, &problem, MatmulIdent::Rhs),
            &mut out,
        )
        .unwrap();

        assert!(report.workgroups > 0, "{strategy:?}");
        if let Err(message) = assert_equals_approx(&out, &expected, 1e-3) {
            panic!("{strategy:?}: {message}");
        }
    }
}
