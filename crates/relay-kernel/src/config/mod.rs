//! Engine configuration.
//!
//! [`EngineConfig`] and its parts are plain serde types and are always
//! available. With the `config` feature this module also loads them from
//! YAML, TOML, JSON, INI, RON or JSON5 files:
//!
//! - format auto-detected from the file extension
//! - `${VAR}` and `$VAR` substitution before parsing
//! - optional environment overrides (`RELAY__POOL__MAX_SIZE=8`)

mod engine;

pub use engine::{DomainOverride, EngineConfig, PoolConfig, WORKER_DOMAIN_ENV, WorkerCommand};

#[cfg(feature = "config")]
use config::{Config as Cfg, Environment, File, FileFormat};
#[cfg(feature = "config")]
use regex::Regex;
#[cfg(feature = "config")]
use serde::de::DeserializeOwned;
#[cfg(feature = "config")]
use std::path::Path;
#[cfg(feature = "config")]
use std::sync::LazyLock;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// `.yaml`/`.yml`, `.toml`, `.json`, `.ini`, `.ron` and `.json5` are
/// recognised; anything else is [`ConfigError::UnsupportedFormat`].
#[cfg(feature = "config")]
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

#[cfg(feature = "config")]
static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

#[cfg(feature = "config")]
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex"));

/// Substitute environment variables in a string
///
/// `${NAME}` is replaced first, then `$NAME`. Unset variables are left as
/// written so the parser reports them in context.
#[cfg(feature = "config")]
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, env_lookup);
    BARE_VAR.replace_all(&braced, env_lookup).into_owned()
}

#[cfg(feature = "config")]
fn env_lookup(caps: &regex::Captures<'_>) -> String {
    std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
}

#[cfg(feature = "config")]
fn build<T>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from a string with explicit format
#[cfg(feature = "config")]
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);
    build(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Load configuration from a file, detecting the format from its extension
#[cfg(feature = "config")]
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration with environment variable overrides
///
/// Variables are prefixed with `env_prefix` and use `__` for nesting, so
/// `pool.max_size` is overridden by `RELAY__POOL__MAX_SIZE` when the
/// prefix is `RELAY`.
#[cfg(feature = "config")]
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content);

    build(
        Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
