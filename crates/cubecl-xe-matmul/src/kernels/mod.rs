//! Kernels driving the components over a launch grid.

pub mod dual;
pub mod gemm;
pub mod grouped;
pub mod streamk;
pub mod workgroup;
