#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
/// Identifier for all three tensors in a matmul
///
/// Useful to specialize some functions depending on the tensor
pub enum MatmulIdent {
    Lhs,
    Rhs,
    Out,
}

impl MatmulIdent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatmulIdent::Lhs => "A",
            MatmulIdent::Rhs => "B",
            MatmulIdent::Out => "D",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
/// Which operand stream of an ident an operation targets.
///
/// Only the dual GEMM mainloop stages more than one stream for [MatmulIdent::Rhs].
pub enum OperandStream {
    #[default]
    Primary,
    Secondary,
}
