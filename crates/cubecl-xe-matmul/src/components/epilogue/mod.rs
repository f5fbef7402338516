//! Writeback of the accumulators to the output tensor.

mod base;
mod linear_combination;
mod row_softmax;

pub use base::*;
pub use linear_combination::*;
pub use row_softmax::*;
