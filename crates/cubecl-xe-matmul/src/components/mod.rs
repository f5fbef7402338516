pub mod epilogue;
pub mod global;
pub mod tile;
pub mod tiling;
pub mod transfer;

mod error;
mod ident;
mod precision;
mod problem;

pub use error::*;
pub use ident::*;
pub use precision::*;
pub use problem::*;
pub use tiling::{SubgroupCoord, TileShape, WorkgroupCoord, WorkgroupTiling};
