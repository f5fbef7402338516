use serde::{Deserialize, Serialize};

use cubecl_xe_matmul::components::{
    GemmMode, MatmulIdent, MatmulProblem, MatrixLayout, ProblemShape, global::memory::Strides,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
/// Description of an attention problem to solve, regardless of actual data
///
/// Every head of every batch is an independent problem. Tensors are packed with the heads
/// outermost: Q is `[batch * num_heads, seq_q, head_dim]`, K is
/// `[batch * num_heads, seq_kv, head_dim]`, V is `[batch * num_heads, seq_kv, val_dim]` and
/// the output is `[batch * num_heads, seq_q, val_dim]`.
pub struct AttentionProblem {
    /// Batch size
    pub batch: usize,
    /// Number of attention heads
    pub num_heads: usize,

    /// Query sequence length
    pub seq_q: usize,
    /// Key/Value sequence length
    pub seq_kv: usize,
    /// Dimension of each head (d)
    pub head_dim: usize,
    /// Dimension of each value vector.
    /// Usually equal to `head_dim`, but may differ in some variants
    pub val_dim: usize,

    /// Whether key `j` is hidden from query `i` when `j > i`
    pub causal: bool,
}

impl AttentionProblem {
    /// Number of independent `(batch, head)` problems.
    pub fn heads(&self) -> usize {
        self.batch * self.num_heads
    }

    /// Softmax scale used when none is given, `1/sqrt(head_dim)`.
    pub fn default_scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// `S = Q·Kᵗ` as a batched GEMM; K is read as a column major B operand.
    pub fn score_problem(&self) -> MatmulProblem {
        MatmulProblem {
            shape: ProblemShape::new(self.seq_q, self.seq_kv, self.head_dim, self.heads()),
            rank: 4,
            mode: GemmMode::Batched,
            lhs_layout: MatrixLayout::RowMajor,
            rhs_layout: MatrixLayout::ColMajor,
        }
    }

    /// `O = P·V` as a batched GEMM.
    pub fn value_problem(&self) -> MatmulProblem {
        MatmulProblem {
            shape: ProblemShape::new(self.seq_q, self.val_dim, self.seq_kv, self.heads()),
            rank: 4,
            mode: GemmMode::Batched,
            lhs_layout: MatrixLayout::RowMajor,
            rhs_layout: MatrixLayout::RowMajor,
        }
    }

    /// Packed strides of the query.
    pub fn query_strides(&self) -> Strides {
        Strides::row_major(self.seq_q, self.head_dim)
    }

    /// Packed strides of the key, seen as the `(head_dim, seq_kv)` B operand of the scores.
    pub fn key_strides(&self) -> Strides {
        Strides::col_major(self.head_dim, self.seq_kv)
    }

    /// Packed strides of the value.
    pub fn value_strides(&self) -> Strides {
        Strides::row_major(self.seq_kv, self.val_dim)
    }

    /// Packed strides of the output.
    pub fn out_strides(&self) -> Strides {
        Strides::row_major(self.seq_q, self.val_dim)
    }

    /// Shape `(rows, cols, batch)` of the output.
    pub fn out_shape(&self) -> (usize, usize, usize) {
        self.value_problem().shape.shape(MatmulIdent::Out)
    }
}
