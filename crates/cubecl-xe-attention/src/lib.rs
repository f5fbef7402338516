//! Fused flash attention for Intel Xe subgroup hardware.
//!
//! Each work-group owns a block of query rows of one head. Scores `Q·Kᵗ` are computed one key
//! block at a time with the GEMM components of [cubecl_xe_matmul], reduced by an
//! [online softmax](components::softmax) and accumulated against `V`, so a full row of scores
//! never exists at once.

#[macro_use]
extern crate derive_new;

mod base;

/// Components for attention
pub mod components;
/// Contains the attention kernels
pub mod kernels;

#[cfg(any(test, feature = "export_tests"))]
pub mod tests;

pub use base::*;
