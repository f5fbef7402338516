//! Mainloops reducing the K dimension of a work-group tile, and what they are built from.

pub mod barrier;
pub mod copy;
pub mod listener;
pub mod memory;
pub mod prefetch;

mod base;
mod dual;
mod grouped;
mod mixed_input;
mod pipelined;
mod unpredicated;

pub use base::*;
pub use dual::*;
pub use grouped::*;
pub use mixed_input::*;
pub use pipelined::*;
pub use unpredicated::*;
