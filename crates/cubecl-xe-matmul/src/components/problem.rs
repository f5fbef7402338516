use serde::{Deserialize, Serialize};

use crate::components::MatmulIdent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
/// Sizes of a matmul problem: `(M, K) @ (K, N) -> (M, N)`, repeated `l` times.
pub struct ProblemShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub l: usize,
}

impl ProblemShape {
    /// A single, unbatched problem.
    pub fn gemm(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k, l: 1 }
    }

    /// Number of K tiles of size `blk_k` needed to cover K.
    pub fn k_tiles(&self, blk_k: usize) -> usize {
        self.k.div_ceil(blk_k)
    }

    /// Shape `(rows, cols, batch)` of the identified tensor in matmul orientation.
    pub fn shape(&self, ident: MatmulIdent) -> (usize, usize, usize) {
        match ident {
            MatmulIdent::Lhs => (self.m, self.k, self.l),
            MatmulIdent::Rhs => (self.k, self.n, self.l),
            MatmulIdent::Out => (self.m, self.n, self.l),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// Layout of a matrix in global memory
pub enum MatrixLayout {
    #[default]
    RowMajor,
    ColMajor,
}

impl MatrixLayout {
    /// Whether an operand in this layout is loaded with a transposing block transfer.
    ///
    /// The contiguous dimension of A is K in row major, and of B is N in row major.
    /// Any other arrangement has the rows contiguous and needs the transposed load.
    pub fn is_transposed(&self) -> bool {
        matches!(self, MatrixLayout::ColMajor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// How a launch interprets its problem shape.
pub enum GemmMode {
    /// A single problem; `L` must be 1.
    Gemm,
    /// `L` independent problems sharing strides.
    Batched,
    /// Independent problems with their own pointers, strides and sizes.
    Grouped,
}

impl GemmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GemmMode::Gemm => "gemm",
            GemmMode::Batched => "batched",
            GemmMode::Grouped => "grouped",
        }
    }
}

#[derive(Clone, Debug)]
/// Description of a matmul problem to solve, regardless of actual data
pub struct MatmulProblem {
    pub shape: ProblemShape,
    /// Number of modes of the problem shape, `3` for `(M, N, K)` and `4` for `(M, N, K, L)`.
    pub rank: usize,
    pub mode: GemmMode,
    pub lhs_layout: MatrixLayout,
    pub rhs_layout: MatrixLayout,
}

impl MatmulProblem {
    pub fn gemm(m: usize, n: usize, k: usize) -> Self {
        Self {
            shape: ProblemShape::gemm(m, n, k),
            rank: 3,
            mode: GemmMode::Gemm,
            lhs_layout: MatrixLayout::RowMajor,
            rhs_layout: MatrixLayout::RowMajor,
        }
    }

    pub fn batched(m: usize, n: usize, k: usize, l: usize) -> Self {
        Self {
            shape: ProblemShape::new(m, n, k, l),
            rank: 4,
            mode: GemmMode::Batched,
            lhs_layout: MatrixLayout::RowMajor,
            rhs_layout: MatrixLayout::RowMajor,
        }
    }

    pub fn with_layouts(mut self, lhs_layout: MatrixLayout, rhs_layout: MatrixLayout) -> Self {
        self.lhs_layout = lhs_layout;
        self.rhs_layout = rhs_layout;
        self
    }

    pub fn layout(&self, ident: MatmulIdent) -> MatrixLayout {
        match ident {
            MatmulIdent::Lhs => self.lhs_layout,
            MatmulIdent::Rhs => self.rhs_layout,
            MatmulIdent::Out => MatrixLayout::RowMajor,
        }
    }
}
