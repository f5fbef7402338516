use std::fmt::{Debug, Display};

use cubecl_xe_matmul::components::{InvalidConfigError, MatmulAvailabilityError, MatmulSetupError};

/// Errors that can occur during the setup phase of an attention operation.
pub enum AttentionSetupError {
    /// The problem cannot be handled by the attention kernel.
    Unavailable(MatmulAvailabilityError),

    /// The provided configuration is invalid or rejected by a component.
    InvalidConfig(InvalidConfigError),
}

impl From<MatmulSetupError> for AttentionSetupError {
    fn from(value: MatmulSetupError) -> Self {
        match value {
            MatmulSetupError::Unavailable(err) => Self::Unavailable(err),
            MatmulSetupError::InvalidConfig(err) => Self::InvalidConfig(err),
        }
    }
}

impl From<MatmulAvailabilityError> for AttentionSetupError {
    fn from(value: MatmulAvailabilityError) -> Self {
        Self::Unavailable(value)
    }
}

impl Display for AttentionSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for AttentionSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionSetupError::Unavailable(err) => {
                writeln!(
                    f,
                    "Unable to launch attention because the problem can't be implemented: {err:?}"
                )
            }
            AttentionSetupError::InvalidConfig(err) => {
                writeln!(
                    f,
                    "Unable to launch attention because the config is invalid: {:?}",
                    err.to_string()
                )
            }
        }
    }
}
