use std::{fmt::Display, sync::Arc};

use hashbrown::HashMap;

#[cfg(feature = "std")]
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use super::{
    XeConfig,
    kernel::KernelLogLevel,
};

/// Configuration for logging, parameterized by a log level type.
///
/// Note that you can use multiple loggers at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled (requires `std` feature).
    #[serde(default)]
    #[cfg(feature = "std")]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            #[cfg(feature = "std")]
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

#[derive(Hash, PartialEq, Eq)]
enum LoggerId {
    #[cfg(feature = "std")]
    File(PathBuf),
    Stdout,
    Stderr,
    LogCrate(LogCrateLevel),
}

/// Central logging utility, managing multiple log outputs.
#[derive(Debug)]
pub struct Logger {
    loggers: Vec<LoggerKind>,
    /// Indices of loggers used for kernel logging.
    kernel_index: Vec<usize>,
    /// Global configuration for logging settings.
    pub config: Arc<XeConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new `Logger` instance based on the global configuration.
    ///
    /// Note that creating a logger opens its files, so it should be kept around.
    pub fn new() -> Self {
        let config = XeConfig::get();
        let mut loggers = Vec::new();
        let mut kernel_index = Vec::new();
        let mut logger2index = HashMap::<LoggerId, usize>::new();

        let mut register = |id: LoggerId, make: &dyn Fn() -> Option<LoggerKind>| {
            if let Some(index) = logger2index.get(&id) {
                kernel_index.push(*index);
            } else if let Some(logger) = make() {
                let index = loggers.len();
                logger2index.insert(id, index);
                loggers.push(logger);
                kernel_index.push(index);
            }
        };

        let kind = &config.kernel.logger;

        if kind.level != KernelLogLevel::Disabled {
            #[cfg(feature = "std")]
            if let Some(file) = &kind.file {
                register(LoggerId::File(file.clone()), &|| {
                    FileLogger::new(file, kind.append).map(LoggerKind::File)
                });
            }

            if kind.stdout {
                register(LoggerId::Stdout, &|| Some(LoggerKind::Stdout));
            }

            if kind.stderr {
                register(LoggerId::Stderr, &|| Some(LoggerKind::Stderr));
            }

            if let Some(level) = kind.log {
                register(LoggerId::LogCrate(level), &|| Some(LoggerKind::Log(level)));
            }
        }

        Self {
            loggers,
            kernel_index,
            config,
        }
    }

    /// Logs a message for kernels, directing it to all configured kernel loggers.
    pub fn log_kernel<S: Display>(&mut self, msg: &S) {
        let length = self.kernel_index.len();
        if length > 1 {
            let msg = msg.to_string();
            for i in 0..length {
                let index = self.kernel_index[i];
                self.log(&msg, index)
            }
        } else if let Some(index) = self.kernel_index.first() {
            self.log(&msg, *index)
        }
    }

    /// Returns the current kernel log level from the global configuration.
    pub fn log_level_kernel(&self) -> KernelLogLevel {
        self.config.kernel.logger.level
    }

    fn log<S: Display>(&mut self, msg: &S, index: usize) {
        let logger = &mut self.loggers[index];
        logger.log(msg);
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    #[cfg(feature = "std")]
    File(FileLogger),

    /// Logs to standard output.
    Stdout,

    /// Logs to standard error.
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            #[cfg(feature = "std")]
            LoggerKind::File(file_logger) => file_logger.log(msg),
            LoggerKind::Stdout => println!("{msg}"),
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
#[cfg(feature = "std")]
struct FileLogger {
    writer: BufWriter<File>,
}

#[cfg(feature = "std")]
impl FileLogger {
    // A file that can't be opened disables the logger instead of failing the launch.
    fn new(path: &PathBuf, append: bool) -> Option<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        match file {
            Ok(file) => Some(Self {
                writer: BufWriter::new(file),
            }),
            Err(err) => {
                log::warn!("Unable to open kernel log file {path:?}: {err}");
                None
            }
        }
    }

    fn log<S: Display>(&mut self, msg: &S) {
        if writeln!(self.writer, "{msg}")
            .and_then(|_| self.writer.flush())
            .is_err()
        {
            log::warn!("Unable to write to the kernel log file");
        }
    }
}
