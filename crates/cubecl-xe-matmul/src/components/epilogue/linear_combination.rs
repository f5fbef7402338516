use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::components::{
    AccG, AccR, MatmulAvailabilityError, MatmulPrecision, Numeric, ProblemShape, SubgroupCoord,
    WorkgroupTiling,
    epilogue::{DualEpilogue, Epilogue, base::check_output_shape},
    global::{
        barrier::SubgroupBarrier,
        memory::{OutputTensor, TensorView},
    },
    tile::Fragment,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Elementwise function applied before the store.
pub enum Activation {
    #[default]
    Identity,
    Relu,
    /// Tanh approximation.
    Gelu,
    Silu,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::Gelu => {
                const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
            }
            Activation::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

/// `D = act(alpha · acc + beta · C)`.
///
/// Without a source `C`, the `beta` term is skipped. The combination is evaluated in `f64`, so
/// `i32` accumulators are stored exactly.
pub struct LinearCombination<'a, MP: MatmulPrecision> {
    output: OutputTensor<'a, AccG<MP>>,
    source: Option<TensorView<'a, AccG<MP>>>,
    pub alpha: f32,
    pub beta: f32,
    pub activation: Activation,
    _phantom: PhantomData<MP>,
}

impl<'a, MP: MatmulPrecision> LinearCombination<'a, MP> {
    /// `D = acc`.
    pub fn new(output: OutputTensor<'a, AccG<MP>>) -> Self {
        Self {
            output,
            source: None,
            alpha: 1.0,
            beta: 0.0,
            activation: Activation::Identity,
            _phantom: PhantomData,
        }
    }

    pub fn with_source(mut self, source: TensorView<'a, AccG<MP>>, beta: f32) -> Self {
        self.source = Some(source);
        self.beta = beta;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// `act(alpha · acc + beta · C)` at `(r, c)` of the subgroup tile at `coord`.
    pub(crate) fn apply_at(
        &self,
        acc: AccR<MP>,
        coord: &SubgroupCoord,
        r: usize,
        c: usize,
    ) -> f64 {
        let mut value = self.alpha as f64 * acc.to_f64();
        if let Some(source) = &self.source {
            value += self.beta as f64 * source.read(coord.m + r, coord.n + c, coord.l).to_f64();
        }
        self.activation.apply(value)
    }

    pub(crate) fn output(&self) -> &OutputTensor<'a, AccG<MP>> {
        &self.output
    }

    pub(crate) fn check(&self, problem: &ProblemShape) -> Result<(), MatmulAvailabilityError> {
        check_output_shape(self.output.shape(), problem)
    }
}

impl<MP: MatmulPrecision> Epilogue<MP> for LinearCombination<'_, MP> {
    type SharedStorage = ();

    fn can_implement(
        &self,
        problem: &ProblemShape,
        _tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError> {
        self.check(problem)
    }

    fn store<B: SubgroupBarrier>(
        &self,
        acc: &Fragment<AccR<MP>>,
        coord: &SubgroupCoord,
        _tiling: &WorkgroupTiling,
        _shared: &Self::SharedStorage,
        _barrier: &mut B,
    ) {
        let out = Fragment::from_fn(acc.rows(), acc.cols(), |r, c| {
            AccG::<MP>::from_f64(self.apply_at(acc.get(r, c), coord, r, c))
        });

        self.output.store(&out, coord.m, coord.n, coord.l);
    }
}

/// `D = act(alpha0 · acc0 + beta · C) · (alpha1 · acc1)`.
///
/// The gate of a dual GEMM: with [Activation::Silu] this is the SwiGLU projection.
pub struct DualGatedCombination<'a, MP: MatmulPrecision> {
    gate: LinearCombination<'a, MP>,
    pub alpha1: f32,
}

impl<'a, MP: MatmulPrecision> DualGatedCombination<'a, MP> {
    pub fn new(output: OutputTensor<'a, AccG<MP>>, activation: Activation) -> Self {
        Self {
            gate: LinearCombination::new(output).with_activation(activation),
            alpha1: 1.0,
        }
    }

    pub fn with_source(mut self, source: TensorView<'a, AccG<MP>>, beta: f32) -> Self {
        self.gate = self.gate.with_source(source, beta);
        self
    }

    pub fn with_alphas(mut self, alpha0: f32, alpha1: f32) -> Self {
        self.gate = self.gate.with_alpha(alpha0);
        self.alpha1 = alpha1;
        self
    }
}

impl<MP: MatmulPrecision> DualEpilogue<MP> for DualGatedCombination<'_, MP> {
    fn can_implement(
        &self,
        problem: &ProblemShape,
        _tiling: &WorkgroupTiling,
    ) -> Result<(), MatmulAvailabilityError> {
        self.gate.check(problem)
    }

    fn store(
        &self,
        acc0: &Fragment<AccR<MP>>,
        acc1: &Fragment<AccR<MP>>,
        coord: &SubgroupCoord,
    ) {
        let out = Fragment::from_fn(acc0.rows(), acc0.cols(), |r, c| {
            let gate = self.gate.apply_at(acc0.get(r, c), coord, r, c);
            AccG::<MP>::from_f64(gate * self.alpha1 as f64 * acc1.get(r, c).to_f64())
        });
        self.gate.output().store(&out, coord.m, coord.n, coord.l);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activations() {
        assert_eq!(Activation::Identity.apply(-2.0), -2.0);
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert!((Activation::Gelu.apply(1.0) - 0.841_192).abs() < 1e-4);
        assert!((Activation::Silu.apply(1.0) - 0.731_058_6).abs() < 1e-5);
        assert_eq!(Activation::Silu.apply(0.0), 0.0);
    }
}
