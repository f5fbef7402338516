use std::sync::Arc;

use super::kernel::{KernelConfig, KernelLogLevel};

/// Static mutex holding the global configuration, initialized as `None`.
static XE_GLOBAL_CONFIG: spin::Mutex<Option<Arc<XeConfig>>> = spin::Mutex::new(None);

/// Global configuration of the Xe kernels.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct XeConfig {
    /// Configuration for kernel setup and launches.
    #[serde(default)]
    pub kernel: KernelConfig,
}

impl XeConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `cubecl-xe.toml` or `CubeclXe.toml`
    /// in the current directory or its parents. If no file is found, a default configuration is used.
    pub fn get() -> Arc<Self> {
        let mut state = XE_GLOBAL_CONFIG.lock();

        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "std")] {
                        let config = Self::from_current_dir();
                        let config = config.override_from_env();
                    } else {
                        let config = Self::default();
                    }
                }

                let config = Arc::new(config);
                *state = Some(config.clone());
                config
            }
        }
    }

    #[cfg(feature = "std")]
    /// Save the default configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        use std::io::Write;

        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref()).map_err(std::io::Error::other)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    pub fn set(config: Self) {
        let mut state = XE_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    #[cfg(feature = "std")]
    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("CUBECL_XE_DEBUG_LOG") {
            self.kernel.logger.level = KernelLogLevel::Full;

            match val.as_str() {
                "stdout" => {
                    self.kernel.logger.stdout = true;
                }
                "stderr" => {
                    self.kernel.logger.stderr = true;
                }
                "1" | "true" => {
                    self.kernel.logger.file = Some("/tmp/cubecl-xe.log".into());
                }
                "0" | "false" => {
                    self.kernel.logger.level = KernelLogLevel::Disabled;
                }
                file_path => {
                    self.kernel.logger.file = Some(file_path.into());
                }
            }
        };

        if let Ok(val) = std::env::var("CUBECL_XE_PREFETCH") {
            match val.as_str() {
                "0" | "false" => self.kernel.prefetch = false,
                "1" | "true" => self.kernel.prefetch = true,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("CUBECL_XE_STAGES")
            && let Ok(stages) = val.parse()
        {
            self.kernel.stages = stages;
        }

        self
    }

    // Loads configuration from `cubecl-xe.toml` or `CubeclXe.toml` in the current directory or its parents.
    #[cfg(feature = "std")]
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            if let Ok(content) = Self::from_file_path(dir.join("cubecl-xe.toml")) {
                return content;
            }

            if let Ok(content) = Self::from_file_path(dir.join("CubeclXe.toml")) {
                return content;
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path.
    #[cfg(feature = "std")]
    pub(crate) fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match toml::from_str(&content) {
            Ok(val) => val,
            Err(err) => panic!("The file provided doesn't have the right format => {err:?}"),
        };

        Ok(config)
    }
}
