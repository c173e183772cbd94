//! This module contains functionality to initialise tracing Subscribers for
//! console output and rolling file output.
//!
//! To get started, see [`Tracing`].

use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender},
};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

use crate::tracing::settings::*;

pub mod settings;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors which can be encountered when initialising [`Tracing`].
#[derive(Debug, Snafu)]
pub enum Error {
    /// Indicates that [`Tracing`] failed to install the rolling file appender.
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender {
        #[allow(missing_docs)]
        source: InitError,
    },

    /// Indicates that [`Tracing`] failed to set the global default subscriber.
    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber {
        #[allow(missing_docs)]
        source: SetGlobalDefaultError,
    },
}

/// Easily initialize a set of pre-configured [`Subscriber`][1] layers.
///
/// # Usage
///
/// The configured subscribers are active as long as the tracing guard returned
/// by [`Tracing::init`] is in scope. Dropping it flushes and stops the
/// background writer of the file logs, so hold onto it until the process
/// exits.
///
/// <div class="warning">
/// Name the guard variable appropriately, do not just use <code>let _ =</code>, as that will drop
/// immediately.
/// </div>
///
/// ```
/// # use mutator_telemetry::tracing::{Tracing, Error};
/// use tracing_subscriber::filter::LevelFilter;
///
/// fn main() -> Result<(), Error> {
///     let _tracing_guard = Tracing::builder()
///         .service_name("test")
///         .with_console_output(("TEST_CONSOLE", LevelFilter::INFO))
///         .build()
///         .init()?;
///
///     tracing::info!("log a message");
///     Ok(())
/// }
/// ```
///
/// Most binaries should use [`Tracing::pre_configured`] together with
/// [`TelemetryOptions`] instead of calling the builder directly.
///
/// ## Environment Variables and CLI Arguments
///
/// ### Console logs
///
/// - `CONSOLE_LOG_DISABLED` (`--console-log-disabled`): Disables console logs when set to `true`.
/// - `CONSOLE_LOG_FORMAT` (`--console-log-format`): Either `plain` (default) or `json`.
/// - `CONSOLE_LOG_LEVEL`: Set the log level for the console logs.
///
/// ### File logs
///
/// - `FILE_LOG_DIRECTORY` (`--file-log-directory`): Enable the file logs and set the file log directory.
/// - `FILE_LOG_ROTATION_PERIOD` (`--file-log-rotation-period`): Set the rotation period of log files.
/// - `FILE_LOG_MAX_FILES` (`--file-log-max-files`): Limit the number of rotated log files kept on disk.
/// - `FILE_LOG_LEVEL`: Set the log level for file logs.
///
/// [1]: tracing::Subscriber
pub struct Tracing {
    service_name: &'static str,
    console_log_settings: ConsoleLogSettings,
    file_log_settings: FileLogSettings,

    file_log_guard: Option<WorkerGuard>,
}

impl Tracing {
    /// The environment variable used to set the console log level filter.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    /// The environment variable used to set the rolling file log level filter.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    /// The filename used for the rolling file logs.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    /// Creates and returns a [`TracingBuilder`].
    pub fn builder() -> TracingBuilder<builder_state::PreServiceName> {
        TracingBuilder::default()
    }

    /// Creates an returns a pre-configured [`Tracing`] instance which can be initialized by
    /// calling [`Tracing::init()`].
    ///
    /// Console and file logs both default to the INFO level. If no rotation
    /// period is given, the file logs are never rotated.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            console_log_format,
            file_log_directory,
            file_log_rotation_period,
            file_log_max_files,
        } = options;

        let file_log_rotation_period = file_log_rotation_period.unwrap_or_default();

        Self::builder()
            .service_name(service_name)
            .with_console_output((!console_log_disabled).then(|| {
                Settings::builder()
                    .with_environment_variable(Self::CONSOLE_LOG_LEVEL)
                    .with_default_level(LevelFilter::INFO)
                    .console_log_settings_builder()
                    .with_log_format(console_log_format)
                    .build()
            }))
            .with_file_output(file_log_directory.map(|log_directory| {
                let builder = Settings::builder()
                    .with_environment_variable(Self::FILE_LOG_LEVEL)
                    .with_default_level(LevelFilter::INFO)
                    .file_log_settings_builder(log_directory, Self::FILE_LOG_SUFFIX)
                    .with_rotation_period(file_log_rotation_period);

                let builder = match file_log_max_files {
                    Some(max_log_files) => builder.with_max_log_files(max_log_files),
                    None => builder,
                };

                builder.build()
            }))
            .build()
    }

    /// Initialize the configured tracing subscribers, returning a guard that
    /// keeps the file log writer alive until dropped.
    ///
    /// <div class="warning">
    /// Name the guard variable appropriately, do not just use <code>let _ =</code>, as that will drop
    /// immediately.
    /// </div>
    pub fn init(mut self) -> Result<Tracing> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if let ConsoleLogSettings::Enabled {
            common_settings,
            log_format,
        } = &self.console_log_settings
        {
            let env_filter_layer = env_filter_builder(
                common_settings.environment_variable,
                common_settings.default_level,
            );

            let console_output_layer = match log_format {
                Format::Plain => tracing_subscriber::fmt::layer()
                    .with_filter(env_filter_layer)
                    .boxed(),
                Format::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_filter(env_filter_layer)
                    .boxed(),
            };
            layers.push(console_output_layer);
        }

        if let FileLogSettings::Enabled {
            common_settings,
            file_log_dir,
            rotation_period,
            filename_suffix,
            max_log_files,
        } = &self.file_log_settings
        {
            let env_filter_layer = env_filter_builder(
                common_settings.environment_variable,
                common_settings.default_level,
            );

            let file_appender = RollingFileAppender::builder()
                .rotation(rotation_period.clone())
                .filename_prefix(self.service_name.to_string())
                .filename_suffix(filename_suffix);

            let file_appender = if let Some(max_log_files) = max_log_files {
                file_appender.max_log_files(*max_log_files)
            } else {
                file_appender
            };

            let file_appender = file_appender
                .build(file_log_dir)
                .context(InitRollingFileAppenderSnafu)?;
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            self.file_log_guard = Some(guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(env_filter_layer)
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        // The returned value owns the file log guard, dropping it stops the writer
        Ok(self)
    }

    /// The service name used as the prefix of rolled log files.
    pub fn service_name(&self) -> &'static str {
        self.service_name
    }
}

/// This trait is only used for the typestate builder and cannot be implemented
/// outside of this crate.
///
/// The only reason it has pub visibility is because it needs to be at least as
/// visible as the types that use it.
#[doc(hidden)]
pub trait BuilderState: private::Sealed {}

#[doc(hidden)]
mod private {
    use super::*;

    pub trait Sealed {}

    impl Sealed for builder_state::PreServiceName {}
    impl Sealed for builder_state::Config {}
}

/// This module holds the possible states that the builder is in.
///
/// Each state will implement [`BuilderState`] (with no methods), and the
/// Builder struct ([`TracingBuilder`]) itself will be implemented with
/// each state as a generic parameter.
#[doc(hidden)]
pub mod builder_state {
    /// The initial state, before the service name is set.
    #[derive(Default)]
    pub struct PreServiceName;

    /// The state that allows you to configure the supported [`Subscriber`][1]
    /// [`Layer`][2].
    ///
    /// [1]: tracing::Subscriber
    /// [2]: tracing_subscriber::layer::Layer
    #[derive(Default)]
    pub struct Config;
}

#[doc(hidden)]
impl BuilderState for builder_state::PreServiceName {}

#[doc(hidden)]
impl BuilderState for builder_state::Config {}

/// Makes it easy to build a valid [`Tracing`] instance.
#[derive(Default)]
pub struct TracingBuilder<S: BuilderState> {
    service_name: &'static str,
    console_log_settings: ConsoleLogSettings,
    file_log_settings: FileLogSettings,

    /// Allow the generic to be used (needed for impls).
    _marker: std::marker::PhantomData<S>,
}

impl TracingBuilder<builder_state::PreServiceName> {
    /// Set the service name, used as the prefix of the rolling log files.
    pub fn service_name(self, service_name: &'static str) -> TracingBuilder<builder_state::Config> {
        TracingBuilder {
            service_name,
            ..Default::default()
        }
    }
}

impl TracingBuilder<builder_state::Config> {
    /// Enable the console output tracing subscriber and set the default
    /// [`LevelFilter`] which is overridable through the given environment
    /// variable.
    pub fn with_console_output(
        self,
        console_log_settings: impl Into<ConsoleLogSettings>,
    ) -> TracingBuilder<builder_state::Config> {
        TracingBuilder {
            console_log_settings: console_log_settings.into(),
            ..self
        }
    }

    /// Enable the file output tracing subscriber and set the default
    /// [`LevelFilter`] which is overridable through the given environment
    /// variable.
    pub fn with_file_output(
        self,
        file_log_settings: impl Into<FileLogSettings>,
    ) -> TracingBuilder<builder_state::Config> {
        TracingBuilder {
            file_log_settings: file_log_settings.into(),
            ..self
        }
    }

    /// Consumes self and returns a valid [`Tracing`] instance.
    ///
    /// Once built, you can call [`Tracing::init`] to enable the configured
    /// tracing subscribers.
    pub fn build(self) -> Tracing {
        Tracing {
            service_name: self.service_name,
            console_log_settings: self.console_log_settings,
            file_log_settings: self.file_log_settings,
            file_log_guard: None,
        }
    }
}

/// Create an [`EnvFilter`] configured with the given environment variable and default [`Directive`].
fn env_filter_builder(env_var: &str, default_directive: impl Into<Directive>) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}

/// Contains options which can be passed to [`Tracing::pre_configured()`].
///
/// Additionally, this struct can be used as CLI arguments. This functionality
/// is only available if the feature `clap` is enabled.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Output FORMAT of the console logs.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "FORMAT", default_value_t = Format::Plain)
    )]
    pub console_log_format: Format,

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

    /// Maximum NUMBER of rolled over log files to keep.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "NUMBER", requires = "file_log")
    )]
    pub file_log_max_files: Option<usize>,
}

/// Supported periods when the log file is rolled over.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
#[allow(missing_docs)]
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

#[cfg(test)]
mod test {
    use std::{path::PathBuf, str::FromStr};

    use rstest::rstest;
    use settings::Settings;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::rolling::Rotation;

    use super::*;

    #[test]
    fn builder_basic_construction() {
        let trace_guard = Tracing::builder().service_name("test").build();

        assert_eq!(trace_guard.service_name(), "test");
        assert!(trace_guard.console_log_settings.is_disabled());
        assert!(trace_guard.file_log_settings.is_disabled());
    }

    #[test]
    fn builder_with_console_output() {
        let trace_guard = Tracing::builder()
            .service_name("test")
            .with_console_output(
                Settings::builder()
                    .with_environment_variable("ABC_A")
                    .with_default_level(LevelFilter::TRACE)
                    .build(),
            )
            .with_console_output(
                Settings::builder()
                    .with_environment_variable("ABC_B")
                    .with_default_level(LevelFilter::DEBUG)
                    .build(),
            )
            .build();

        assert_eq!(
            trace_guard.console_log_settings,
            ConsoleLogSettings::Enabled {
                common_settings: Settings {
                    environment_variable: "ABC_B",
                    default_level: LevelFilter::DEBUG
                },
                log_format: Default::default()
            }
        );

        assert!(trace_guard.file_log_settings.is_disabled());
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn builder_with_console_output_triple(#[case] enabled: bool) {
        let trace_guard = Tracing::builder()
            .service_name("test")
            .with_console_output(("ABC_A", LevelFilter::TRACE, enabled))
            .build();

        let expected = if enabled {
            ConsoleLogSettings::Enabled {
                common_settings: Settings {
                    environment_variable: "ABC_A",
                    default_level: LevelFilter::TRACE,
                },
                log_format: Default::default(),
            }
        } else {
            ConsoleLogSettings::Disabled
        };

        assert_eq!(trace_guard.console_log_settings, expected);
    }

    #[test]
    fn pre_configured_defaults() {
        let trace_guard = Tracing::pre_configured("webhook", TelemetryOptions::default());

        assert_eq!(
            trace_guard.console_log_settings,
            ConsoleLogSettings::Enabled {
                common_settings: Settings {
                    environment_variable: Tracing::CONSOLE_LOG_LEVEL,
                    default_level: LevelFilter::INFO,
                },
                log_format: Format::Plain,
            }
        );
        assert!(trace_guard.file_log_settings.is_disabled());
    }

    #[test]
    fn pre_configured_with_file_logs() {
        let trace_guard = Tracing::pre_configured("webhook", TelemetryOptions {
            console_log_disabled: true,
            console_log_format: Format::Json,
            file_log_directory: Some(PathBuf::from("/var/log/webhook")),
            file_log_rotation_period: Some(RotationPeriod::Daily),
            file_log_max_files: Some(7),
        });

        assert!(trace_guard.console_log_settings.is_disabled());
        assert_eq!(trace_guard.file_log_settings, FileLogSettings::Enabled {
            common_settings: Settings {
                environment_variable: Tracing::FILE_LOG_LEVEL,
                default_level: LevelFilter::INFO,
            },
            file_log_dir: PathBuf::from("/var/log/webhook"),
            rotation_period: Rotation::DAILY,
            filename_suffix: Tracing::FILE_LOG_SUFFIX.to_owned(),
            max_log_files: Some(7),
        });
    }

    #[rstest]
    #[case("Minutely", Rotation::MINUTELY)]
    #[case("Hourly", Rotation::HOURLY)]
    #[case("Daily", Rotation::DAILY)]
    #[case("Never", Rotation::NEVER)]
    fn rotation_period_into_rotation(#[case] input: &str, #[case] expected: Rotation) {
        let period = RotationPeriod::from_str(input).unwrap();
        assert_eq!(Rotation::from(period), expected);
    }

    #[test]
    fn init_creates_file_log_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_directory = temp_dir.path().join("logs");

        let tracing_guard = Tracing::pre_configured("webhook", TelemetryOptions {
            console_log_disabled: true,
            file_log_directory: Some(log_directory.clone()),
            ..Default::default()
        })
        .init()
        .expect("failed to initialize tracing");

        assert!(log_directory.is_dir());
        drop(tracing_guard);
    }
}
