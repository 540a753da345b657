//! Installs the global tracing subscriber of the addon.
//!
//! Console output is always human readable. When a directory is configured, JSON logs are
//! additionally written to rolling files in it. Both outputs filter independently, see
//! [`Tracing::CONSOLE_LOG_LEVEL`] and [`Tracing::FILE_LOG_LEVEL`].
//!
//! To get started, see [`Tracing::pre_configured`].

use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{Layer, Registry, layer::SubscriberExt};

use crate::tracing::settings::{FileLog, LogFilter, Rotation};

pub mod settings;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors which can be encountered when initialising [`Tracing`].
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender in {directory:?}"))]
    InitRollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// The configured log outputs of a service.
///
/// Keep the value returned by [`Tracing::init`] alive for as long as the process logs.
///
/// ```
/// # use capsule_addon_telemetry::tracing::{Error, TelemetryOptions, Tracing};
/// fn main() -> Result<(), Error> {
///     let _tracing_guard = Tracing::pre_configured("test", TelemetryOptions::default()).init()?;
///
///     tracing::info!("log a message");
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables and CLI Arguments
///
/// - `CONSOLE_LOG_DISABLED` (`--console-log-disabled`): Disables console logs when set to `true`.
/// - `CONSOLE_LOG_LEVEL`: Set the log level for the console logs.
/// - `FILE_LOG_DIRECTORY` (`--file-log-directory`): Enable the file logs and set the file log directory.
/// - `FILE_LOG_ROTATION_PERIOD` (`--file-log-rotation-period`): Set the rotation period of log files.
/// - `FILE_LOG_MAX_FILES` (`--file-log-max-files`): Set how many rolled log files are kept.
/// - `FILE_LOG_LEVEL`: Set the log level for file logs.
#[derive(Debug, PartialEq, Eq)]
pub struct Tracing {
    service_name: &'static str,
    console_log: Option<LogFilter>,
    file_log: Option<FileLog>,
}

impl Tracing {
    /// The environment variable used to set the console log level filter.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    /// The environment variable used to set the rolling file log level filter.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";
    /// Used when `--file-log-max-files` isn't given.
    pub const DEFAULT_MAX_LOG_FILES: usize = 6;

    /// Builds the outputs described by `options`, both defaulting to INFO.
    ///
    /// `service_name` prefixes the names of the log files.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            file_log_directory,
            file_log_rotation_period,
            file_log_max_files,
        } = options;

        let console_log = (!console_log_disabled)
            .then(|| LogFilter::new(Self::CONSOLE_LOG_LEVEL, LevelFilter::INFO));
        let file_log = file_log_directory.map(|directory| FileLog {
            filter: LogFilter::new(Self::FILE_LOG_LEVEL, LevelFilter::INFO),
            directory,
            rotation: file_log_rotation_period.unwrap_or_default().into(),
            filename_suffix: Self::FILE_LOG_SUFFIX.to_owned(),
            max_files: Some(file_log_max_files.unwrap_or(Self::DEFAULT_MAX_LOG_FILES)),
        });

        Self {
            service_name,
            console_log,
            file_log,
        }
    }

    /// Installs the configured outputs as the global default subscriber.
    ///
    /// Fails if a global subscriber has already been installed.
    pub fn init(self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if let Some(filter) = &self.console_log {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(filter.env_filter())
                    .boxed(),
            );
        }

        if let Some(file_log) = &self.file_log {
            let mut appender = RollingFileAppender::builder()
                .rotation(file_log.rotation.clone())
                .filename_prefix(self.service_name)
                .filename_suffix(&file_log.filename_suffix);
            if let Some(max_files) = file_log.max_files {
                appender = appender.max_log_files(max_files);
            }
            let appender =
                appender
                    .build(&file_log.directory)
                    .context(InitRollingFileAppenderSnafu {
                        directory: file_log.directory.clone(),
                    })?;

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(appender)
                    .with_filter(file_log.filter.env_filter())
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        if let Some(file_log) = &self.file_log {
            tracing::info!(directory = %file_log.directory.display(), "file logging enabled");
        }

        Ok(self)
    }
}

/// Logging options of a service.
///
/// Can be flattened into a clap parser when the `clap` feature is enabled.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Enable logging to files located in the specified DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Number of rolled log files to keep.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "COUNT", requires = "file_log")
    )]
    pub file_log_max_files: Option<usize>,
}

/// Supported periods when the log file is rolled over.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
