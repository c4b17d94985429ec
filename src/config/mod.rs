use std::{borrow::Cow, path::PathBuf};

use clap::{ArgAction, Args, Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment, Provider,
};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::level_filters::LevelFilter;

use self::hcl::Hcl;

mod hcl;
mod validate;

fn default_worker_threads() -> usize {
    num_cpus::get()
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Trace,
}

/// Transforms our custom `LogLevel` enum into a `tracing::level_filters::LevelFilter`
/// enum used by the `tracing` crate.
impl From<&LogLevel> for tracing::level_filters::LevelFilter {
    fn from(val: &LogLevel) -> Self {
        match val {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone, Args)]
#[group(id = "logging")]
pub struct Logging {
    /// If logging is enabled at all. Setting this to `false` will disable all logging output.
    #[arg(
        long = "log.enabled",
        required = false,
        action = ArgAction::Set,
        default_value = "true",
        id = "log.enabled"
    )]
    pub enabled: bool,

    /// The level of logging to be used.
    #[serde(deserialize_with = "log_level_deser")]
    #[arg(
        long = "log.level",
        required = false,
        value_enum,
        default_value = "info"
    )]
    pub level: LogLevel,

    /// The format of the log output
    #[serde(deserialize_with = "log_format_deser")]
    #[arg(
        long = "log.format",
        required = false,
        value_enum,
        default_value = "pretty"
    )]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Args)]
#[group(id = "stats")]
pub struct StatsCfg {
    /// Periodically log fixer counters and issuer cache hits/misses
    #[arg(
        long = "stats.enabled",
        required = false,
        action = ArgAction::Set,
        default_value = "false",
        id = "stats.enabled"
    )]
    pub enabled: bool,

    /// How often (in seconds) the counters are logged
    #[arg(
        long = "stats.interval_secs",
        required = false,
        value_parser,
        default_value = "1",
        id = "stats.interval_secs"
    )]
    pub interval_secs: u64,
}

impl Default for StatsCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Args)]
#[group(id = "fetch")]
pub struct FetchCfg {
    /// Timeout (in seconds) for each issuer certificate download
    #[arg(
        long = "fetch.timeout_secs",
        required = false,
        value_parser,
        default_value = "10",
        id = "fetch.timeout_secs"
    )]
    pub timeout_secs: u64,

    /// User agent sent when downloading issuer certificates
    #[arg(
        long = "fetch.user_agent",
        required = false,
        value_parser,
        default_value = "chainfix"
    )]
    pub user_agent: Cow<'static, str>,
}

impl Default for FetchCfg {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: Cow::Borrowed("chainfix"),
        }
    }
}

/// The main configuration struct.
/// A configuration file (YAML, HCL or through ENV) will be parsed into this struct.
/// Example:
///
/// ```yaml
///
/// # Example configuration file
/// service_name: "chainfix"
/// worker_threads: 8
/// roots: "/etc/chainfix/roots.pem"
/// output: "/var/lib/chainfix/fixed"
/// logging:
///   level: "INFO"
///   format: "json"
/// stats:
///   enabled: true
///   interval_secs: 5
/// fetch:
///   timeout_secs: 10
///   user_agent: "chainfix"
/// ```
///
#[derive(Debug, Serialize, Deserialize, Parser)]
#[command(name = "chainfix")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The name of the service (will appear as a log property)
    #[serde(default)]
    #[clap(short, long, default_value = "chainfix")]
    pub service_name: Cow<'static, str>,

    /// The number of workers fixing chains concurrently.
    /// Defaults to the number of CPUs.
    #[serde(default)]
    #[clap(short, long, required = false)]
    pub worker_threads: Option<usize>,

    /// The PATH to the configuration file to be used.
    ///
    /// The configuration file should be named either `chainfix.hcl` or `chainfix.yaml`
    /// and be present in that path.
    #[clap(short, required = false, long)]
    #[allow(clippy::struct_field_names)]
    pub config_path: Option<Cow<'static, str>>,

    /// PEM bundle with the trusted root certificates
    #[clap(short, long, required = false)]
    pub roots: Option<PathBuf>,

    /// Directory where fixed chains are written (one PEM file per chain).
    /// Chains are printed to stdout when not set.
    #[clap(short, long, required = false)]
    pub output: Option<PathBuf>,

    /// PEM files, each holding a leaf certificate followed by its chain
    #[serde(default)]
    #[arg(required = false)]
    pub inputs: Vec<PathBuf>,

    #[command(flatten)]
    pub logging: Logging,

    #[command(flatten)]
    pub stats: StatsCfg,

    #[command(flatten)]
    pub fetch: FetchCfg,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_name: Cow::Borrowed("chainfix"),
            worker_threads: Some(default_worker_threads()),
            config_path: None,
            roots: None,
            output: None,
            inputs: vec![],
            logging: Logging::default(),
            stats: StatsCfg::default(),
            fetch: FetchCfg::default(),
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(default_worker_threads)
    }
}

/// Implement the `Provider` trait for the `Config` struct.
/// This allows the `Config` struct to be used as a configuration provider with *defaults*.
impl Provider for Config {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("chainfix")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Config::default()).data()
    }
}

/// Load the configuration from the command line, configuration file(s) and
/// environment as a `Config` struct. Later sources override earlier ones.
///
/// Nested keys can be separated by double underscores (__) in the environment variables.
/// E.g. `CHAINFIX_LOGGING__LEVEL=DEBUG` will set the `level` key in the
/// `logging` key.
pub fn load(fallback: &str) -> Result<Config, figment::Error> {
    let parsed_commands = Config::parse();

    let path_with_fallback = match &parsed_commands.config_path {
        Some(path) => path.as_ref(),
        None => fallback,
    };

    load_from_path(path_with_fallback, &parsed_commands)
}

/// Load configuration from a specific path, used for testing and internal logic
pub(crate) fn load_from_path(
    config_path: &str,
    parsed_commands: &Config,
) -> Result<Config, figment::Error> {
    let mut figment = Figment::new()
        .merge(Config::default())
        .merge(Serialized::defaults(parsed_commands));

    let path = std::path::Path::new(config_path);
    if path.is_file() {
        figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml" | "yaml") => figment.merge(Yaml::file(config_path)),
            Some("hcl") => figment.merge(Hcl::file(config_path)),
            _ => figment
                .merge(Yaml::file(config_path))
                .merge(Hcl::file(config_path)),
        };
    } else {
        // Missing files are ignored by figment
        figment = figment
            .merge(Yaml::file(format!("{config_path}/chainfix.yml")))
            .merge(Yaml::file(format!("{config_path}/chainfix.yaml")))
            .merge(Hcl::file(format!("{config_path}/chainfix.hcl")));
    }

    let config: Config = figment
        .merge(Env::prefixed("CHAINFIX_").split("__"))
        .extract()?;

    // validate configuration and throw error upwards
    validate::validate_config(&config).map_err(|err| figment::Error::from(err.to_string()))?;

    Ok(config)
}

/// Deserialize function to convert a string to a `LogLevel` Enum
fn log_level_deser<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.to_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        "trace" => Ok(LogLevel::Trace),
        _ => Err(serde::de::Error::custom(
            "expected one of DEBUG, INFO, WARN, ERROR, TRACE",
        )),
    }
}

/// Deserialize function to convert a string to a `LogFormat` Enum
fn log_format_deser<'de, D>(deserializer: D) -> Result<LogFormat, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(serde::de::Error::custom("expected one of: json, pretty")),
    }
}
