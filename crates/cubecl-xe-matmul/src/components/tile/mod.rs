//! Register-level tiles and the subgroup matrix multiply-accumulate.

mod fragment;
mod mma;

pub use fragment::*;
pub use mma::*;
