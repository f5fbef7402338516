use half::bf16;
use pretty_assertions::assert_eq;

use cubecl_xe_matmul::{
    components::{
        AccG, LhsG, MatmulAvailabilityError, MatmulIdent, OperandStream, RhsG, TileShape,
        WorkgroupCoord,
        global::{
            MainloopSelection,
            listener::{MainloopEvent, NoEvent},
            memory::{OperandArguments, OutputTensor, Strides},
            prefetch::{CacheLinePrefetcher, NoPrefetch, Prefetcher},
        },
        tiling::SubgroupArrangement,
    },
    kernels::workgroup::LaunchReport,
    tests::test_utils::{assert_equals_approx, random_data, to_f32},
};

use crate::{
    components::{AttentionProblem, AttentionSetupError, epilogue::AttentionEpilogue},
    kernels::flash::FlashAttentionKernel,
    tests::naive::attention_reference,
};

type MP = bf16;

fn selection() -> MainloopSelection {
    MainloopSelection::builder(TileShape::new(32, 64, 32), SubgroupArrangement::new(2, 1, 1))
        .stages(2)
        .build()
}

struct Inputs {
    query: Vec<LhsG<MP>>,
    key: Vec<RhsG<MP>>,
    value: Vec<RhsG<MP>>,
}

impl Inputs {
    fn random(problem: &AttentionProblem, seed: u64) -> Self {
        let heads = problem.heads();
        Self {
            query: random_data(heads * problem.seq_q * problem.head_dim, seed, -1.0, 1.0),
            key: random_data(heads * problem.seq_kv * problem.head_dim, seed + 1, -1.0, 1.0),
            value: random_data(heads * problem.seq_kv * problem.val_dim, seed + 2, -1.0, 1.0),
        }
    }

    fn reference(&self, problem: &AttentionProblem, scale: f32) -> Vec<f32> {
        attention_reference(
            problem,
            scale,
            &to_f32(&self.query),
            &to_f32(&self.key),
            &to_f32(&self.value),
        )
    }
}

fn run_flash<P: Prefetcher + Default>(
    kernel: &FlashAttentionKernel<MP>,
    inputs: &Inputs,
) -> (Vec<AccG<MP>>, LaunchReport) {
    let problem = *kernel.problem();
    let mut out = vec![AccG::<MP>::default(); problem.heads() * problem.seq_q * problem.val_dim];

    let views = kernel
        .to_underlying_arguments(
            OperandArguments::new(&inputs.query, problem.query_strides()),
            OperandArguments::new(&inputs.key, problem.key_strides()),
            OperandArguments::new(&inputs.value, problem.value_strides()),
        )
        .unwrap();
    let output = OutputTensor::new(&mut out, problem.out_shape(), problem.out_strides()).unwrap();
    let epilogue = AttentionEpilogue::<MP>::new(output);
    let report = kernel.launch::<P, NoEvent>(&views, &epilogue).unwrap();
    drop(epilogue);

    (out, report)
}

fn check_against_reference(problem: AttentionProblem, seed: u64) {
    let kernel = FlashAttentionKernel::<MP>::setup(&problem, &selection()).unwrap();
    let inputs = Inputs::random(&problem, seed);

    let (out, _) = run_flash::<CacheLinePrefetcher>(&kernel, &inputs);
    let expected = inputs.reference(&problem, problem.default_scale());

    // probabilities are rounded to bf16 before the second product
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-2) {
        panic!("{message}");
    }
}

#[test]
fn flash_attention_matches_reference() {
    check_against_reference(AttentionProblem::new(2, 2, 50, 80, 64, 64, false), 3);
}

#[test]
fn flash_attention_with_distinct_value_dim() {
    check_against_reference(AttentionProblem::new(1, 3, 64, 100, 32, 48, false), 9);
}

#[test]
fn causal_attention_matches_reference() {
    check_against_reference(AttentionProblem::new(1, 2, 130, 130, 64, 64, true), 21);
}

#[test]
fn causal_attention_with_more_queries_than_keys() {
    check_against_reference(AttentionProblem::new(2, 1, 100, 40, 32, 32, true), 17);
}

#[test]
fn explicit_scale_overrides_the_default() {
    let problem = AttentionProblem::new(1, 1, 40, 70, 32, 32, false);
    let inputs = Inputs::random(&problem, 4);
    let mut out = vec![0.0f32; problem.seq_q * problem.val_dim];

    crate::launch::<MP>(
        &problem,
        &selection(),
        Some(0.5),
        &inputs.query,
        &inputs.key,
        &inputs.value,
        &mut out,
    )
    .unwrap();

    let expected = inputs.reference(&problem, 0.5);
    if let Err(message) = assert_equals_approx(&out, &expected, 1e-2) {
        panic!("{message}");
    }
    let default = inputs.reference(&problem, problem.default_scale());
    assert!(assert_equals_approx(&out, &default, 1e-3).is_err());
}

#[test]
fn prefetching_never_changes_the_result() {
    let problem = AttentionProblem::new(1, 2, 64, 150, 64, 64, true);
    let kernel = FlashAttentionKernel::<MP>::setup(&problem, &selection()).unwrap();
    let inputs = Inputs::random(&problem, 12);

    let (without, no_report) = run_flash::<NoPrefetch>(&kernel, &inputs);
    let (with, report) = run_flash::<CacheLinePrefetcher>(&kernel, &inputs);

    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&without), bits(&with));
    assert_eq!(no_report.prefetches, 0);
    assert!(report.prefetches > 0);
}

#[test]
fn empty_key_sequence_yields_zeros() {
    let problem = AttentionProblem::new(1, 1, 32, 0, 32, 32, false);
    let kernel = FlashAttentionKernel::<MP>::setup(&problem, &selection()).unwrap();
    let inputs = Inputs::random(&problem, 1);

    let (out, _) = run_flash::<NoPrefetch>(&kernel, &inputs);

    assert!(out.iter().all(|value| *value == 0.0));
}

#[test]
fn every_key_block_is_a_barrier_round() {
    let problem = AttentionProblem::new(1, 1, 32, 80, 64, 64, false);
    let kernel = FlashAttentionKernel::<MP>::setup(&problem, &selection()).unwrap();
    let inputs = Inputs::random(&problem, 2);
    let mut out = vec![0.0f32; problem.seq_q * problem.val_dim];

    let views = kernel
        .to_underlying_arguments(
            OperandArguments::new(&inputs.query, problem.query_strides()),
            OperandArguments::new(&inputs.key, problem.key_strides()),
            OperandArguments::new(&inputs.value, problem.value_strides()),
        )
        .unwrap();
    let output = OutputTensor::new(&mut out, problem.out_shape(), problem.out_strides()).unwrap();
    let epilogue = AttentionEpilogue::<MP>::new(output);

    let outcomes = kernel.run_workgroup::<NoPrefetch, Vec<MainloopEvent>>(
        &views,
        &epilogue,
        &WorkgroupCoord::new(0, 0, 0, 0),
    );
    drop(epilogue);

    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        let (prefetches, events): (Vec<_>, Vec<_>) = outcome
            .listener
            .into_iter()
            .partition(|event| matches!(event, MainloopEvent::Prefetch { .. }));

        let mut expected = vec![MainloopEvent::Load {
            ident: MatmulIdent::Lhs,
            stream: OperandStream::Primary,
            k_tile: 0,
        }];
        for block in 0..3 {
            expected.extend([
                MainloopEvent::BarrierArrive { k_tile: block },
                MainloopEvent::Load {
                    ident: MatmulIdent::Rhs,
                    stream: OperandStream::Primary,
                    k_tile: block,
                },
                MainloopEvent::Mma {
                    stream: OperandStream::Primary,
                    k_tile: block,
                },
                MainloopEvent::Load {
                    ident: MatmulIdent::Rhs,
                    stream: OperandStream::Secondary,
                    k_tile: block,
                },
                MainloopEvent::Mma {
                    stream: OperandStream::Secondary,
                    k_tile: block,
                },
                MainloopEvent::BarrierWait { k_tile: block },
            ]);
        }
        assert_eq!(events, expected);

        // each key block prefetches its two head tiles of K and its rows of V, once
        let values: Vec<usize> = prefetches
            .iter()
            .filter_map(|event| match event {
                MainloopEvent::Prefetch {
                    stream: OperandStream::Secondary,
                    k_tile,
                    ..
                } => Some(*k_tile),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(prefetches.len(), 3 * 3);
    }
}

#[test]
fn head_dim_must_be_a_multiple_of_the_k_tile() {
    let problem = AttentionProblem::new(1, 1, 64, 64, 48, 64, false);

    let result = FlashAttentionKernel::<MP>::setup(&problem, &selection());

    assert!(matches!(
        result,
        Err(AttentionSetupError::Unavailable(
            MatmulAvailabilityError::NotDivisible {
                dim: "head_dim",
                size: 48,
                tile: 32
            }
        ))
    ));
}

#[test]
fn undersized_output_is_rejected() {
    let problem = AttentionProblem::new(1, 1, 32, 32, 32, 32, false);
    let kernel = FlashAttentionKernel::<MP>::setup(&problem, &selection()).unwrap();
    let inputs = Inputs::random(&problem, 6);
    let mut out = vec![0.0f32; 16 * 32];

    let views = kernel
        .to_underlying_arguments(
            OperandArguments::new(&inputs.query, problem.query_strides()),
            OperandArguments::new(&inputs.key, problem.key_strides()),
            OperandArguments::new(&inputs.value, problem.value_strides()),
        )
        .unwrap();
    let output = OutputTensor::new(&mut out, (16, 32, 1), Strides::row_major(16, 32)).unwrap();
    let epilogue = AttentionEpilogue::<MP>::new(output);

    let result = kernel.launch::<NoPrefetch, NoEvent>(&views, &epilogue);

    assert!(matches!(
        result,
        Err(AttentionSetupError::Unavailable(
            MatmulAvailabilityError::BufferTooSmall { .. }
        ))
    ));
}
