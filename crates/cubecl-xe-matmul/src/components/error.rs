use std::fmt::{Debug, Display};

use crate::components::{MatmulIdent, TileShape};

/// Errors that can occur during the setup phase of a matmul operation.
pub enum MatmulSetupError {
    /// The problem cannot be handled by the selected kernel.
    Unavailable(MatmulAvailabilityError),

    /// The provided configuration is invalid or rejected by a component.
    InvalidConfig(InvalidConfigError),
}

/// A problem that the selected kernel is not able to solve.
///
/// Returned by `can_implement` before any work is dispatched.
pub enum MatmulAvailabilityError {
    /// The mode of the problem is not supported by the kernel.
    ModeUnsupported { mode: &'static str, rank: usize },

    /// A dimension of the problem is not a multiple of the tile it is split into.
    NotDivisible {
        dim: &'static str,
        size: usize,
        tile: usize,
    },

    /// The contiguous extent of a tensor does not fit the 2D block pitch alignment.
    Misaligned {
        ident: MatmulIdent,
        extent: usize,
        elem_bits: u32,
    },

    /// The row reduction epilogue needs whole rows inside one work-group tile.
    RowTooWide { n: usize, tile_n: usize },

    /// Per-group arguments do not agree with the number of groups.
    GroupCountMismatch { groups: usize, got: usize },

    /// A buffer is too small for the shape and strides it is described with.
    BufferTooSmall {
        ident: MatmulIdent,
        len: usize,
        required: usize,
    },

    /// The stream-K split count cannot be honored.
    InvalidSplit { splits: usize, k_tiles: usize },
}

impl From<MatmulAvailabilityError> for MatmulSetupError {
    fn from(value: MatmulAvailabilityError) -> Self {
        Self::Unavailable(value)
    }
}

impl From<InvalidConfigError> for MatmulSetupError {
    fn from(value: InvalidConfigError) -> Self {
        Self::InvalidConfig(value)
    }
}

impl Display for MatmulSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for MatmulSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatmulSetupError::Unavailable(err) => {
                writeln!(
                    f,
                    "Unable to launch matmul because the problem can't be implemented: {err:?}"
                )
            }
            MatmulSetupError::InvalidConfig(err) => {
                writeln!(
                    f,
                    "Unable to launch matmul because the config is invalid: {:?}",
                    err.to_string()
                )
            }
        }
    }
}

impl Display for MatmulAvailabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for MatmulAvailabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatmulAvailabilityError::ModeUnsupported { mode, rank } => {
                writeln!(f, "Mode {mode} with a rank {rank} problem is not supported.")
            }
            MatmulAvailabilityError::NotDivisible { dim, size, tile } => {
                writeln!(
                    f,
                    "Dimension {dim}={size} is not a multiple of its tile size {tile}."
                )
            }
            MatmulAvailabilityError::Misaligned {
                ident,
                extent,
                elem_bits,
            } => writeln!(
                f,
                "Tensor {} has a contiguous extent of {extent} elements of {elem_bits} bits, which is not 4 bytes aligned.",
                ident.as_str()
            ),
            MatmulAvailabilityError::RowTooWide { n, tile_n } => {
                writeln!(
                    f,
                    "Row reduction needs N={n} to fit in a single tile of width {tile_n}."
                )
            }
            MatmulAvailabilityError::GroupCountMismatch { groups, got } => {
                writeln!(f, "Expected arguments for {groups} groups, got {got}.")
            }
            MatmulAvailabilityError::BufferTooSmall {
                ident,
                len,
                required,
            } => writeln!(
                f,
                "Tensor {} has {len} elements but its layout addresses {required}.",
                ident.as_str()
            ),
            MatmulAvailabilityError::InvalidSplit { splits, k_tiles } => {
                writeln!(
                    f,
                    "Cannot split {k_tiles} k tiles into {splits} stream-K units."
                )
            }
        }
    }
}

/// Error that araises from invalid configurations
pub type InvalidConfigError = Box<dyn Display>;

/// Error that araises from invalid configurations
pub struct FormattedConfigError {
    func: Box<dyn Fn() -> String>,
}

impl FormattedConfigError {
    #[allow(clippy::new_ret_no_self)]
    pub fn new<F: Fn() -> String + 'static>(func: F) -> Box<dyn Display> {
        Box::new(Self {
            func: Box::new(func),
        })
    }
}

impl Display for FormattedConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = (self.func)();
        write!(f, "{string}")
    }
}

/// Shorthand for a tile that does not split evenly between subgroups.
pub(crate) fn indivisible_tile(tile: TileShape, dim: &'static str, atoms: usize) -> MatmulSetupError {
    MatmulSetupError::InvalidConfig(FormattedConfigError::new(move || {
        format!("Tile {tile} cannot be split evenly in {atoms} subgroups along {dim}")
    }))
}
