pub mod epilogue;
pub mod mainloop;
pub mod softmax;

mod error;
mod problem;

pub use error::*;
pub use problem::*;
