//! Where log output goes and how it is filtered.
use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
pub use tracing_appender::rolling::Rotation;
use tracing_subscriber::EnvFilter;

/// A level filter that can be overridden through an environment variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    /// Takes precedence over [`Self::default_level`] when set, using [`EnvFilter`] directive
    /// syntax.
    pub environment_variable: &'static str,
    pub default_level: LevelFilter,
}

impl LogFilter {
    pub const fn new(environment_variable: &'static str, default_level: LevelFilter) -> Self {
        Self {
            environment_variable,
            default_level,
        }
    }

    /// Builds the filter, ignoring directives in the environment variable that don't parse.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_env_var(self.environment_variable)
            .with_default_directive(self.default_level.into())
            .from_env_lossy()
    }
}

/// Rolling JSON log files written next to the console output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLog {
    pub filter: LogFilter,
    pub directory: PathBuf,
    pub rotation: Rotation,
    pub filename_suffix: String,

    /// Rolled files beyond this count are deleted. [`None`] keeps all of them.
    pub max_files: Option<usize>,
}
