use super::logger::{LogLevel, LoggerConfig};

/// Configuration of the kernels launched by the engine.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct KernelConfig {
    /// Number of K tiles prefetched ahead of the copies when a selection doesn't choose.
    #[serde(default = "stages_default")]
    pub stages: usize,

    /// Whether the mainloops issue prefetches at all.
    #[serde(default = "prefetch_default")]
    pub prefetch: bool,

    /// Logger for kernel setup and launches.
    #[serde(default)]
    pub logger: LoggerConfig<KernelLogLevel>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stages: stages_default(),
            prefetch: prefetch_default(),
            logger: LoggerConfig::default(),
        }
    }
}

fn stages_default() -> usize {
    3
}

fn prefetch_default() -> bool {
    true
}

/// Verbosity of kernel logging.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KernelLogLevel {
    /// Kernel logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Logs the geometry of every launch.
    #[serde(rename = "basic")]
    Basic,

    /// Also logs the resolved block transfers and prefetch plans.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for KernelLogLevel {}
