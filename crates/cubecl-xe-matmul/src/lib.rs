//! Tile-level GEMM engine for Intel Xe subgroup hardware.
//!
//! A work-group tile is split across subgroups by the [tile partitioner](components::tiling),
//! operands are staged through [copy](components::global::copy) and
//! [prefetch](components::global::prefetch) plans, and the K reduction runs in one of the
//! [mainloop](components::global) variants before an [epilogue](components::epilogue) writes
//! the output.

#[macro_use]
extern crate derive_new;

mod base;

/// Components for matrix multiplication
pub mod components;
/// Runtime configuration and logging.
pub mod config;
/// Contains the kernels driving the components.
pub mod kernels;

#[cfg(any(test, feature = "export_tests"))]
pub mod tests;

pub use base::*;
