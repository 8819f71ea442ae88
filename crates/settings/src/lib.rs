//! `settings` crate — process-wide configuration.
//!
//! Settings are resolved once at process start with layered precedence:
//! explicit argument > `DRIFTFLOW__<SECTION>__<OPTION>` environment variable >
//! TOML config file at `<home>/driftflow.toml` > built-in defaults.  The core
//! engine never parses environment variables or files itself; the entry point
//! loads a [`Settings`] and passes the pieces the engine needs explicitly.
//!
//! The secret key is never kept in memory raw: only its SHA-256 hex digest
//! survives loading.

use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const ENV_PREFIX: &str = "DRIFTFLOW";
const DEFAULT_HOME: &str = "~/.driftflow";
const CONFIG_FILE_NAME: &str = "driftflow.toml";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("cannot expand '~': the HOME environment variable is not set")]
    NoHomeDir,
}

/// Explicit arguments — the highest-precedence layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub home: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub test_mode: Option<bool>,
    pub log_level: Option<String>,
    pub secret_key: Option<String>,
}

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Full,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Maximum in-flight task attempts.
    pub max_concurrency: usize,
    /// Retry delay for tasks that don't configure their own.
    pub default_retry_delay_ms: u64,
}

/// Fully resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub test_mode: bool,
    pub log: LogSettings,
    pub engine: EngineSettings,
    /// SHA-256 hex digest of the configured secret key, if any.
    pub secret_key_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    core: RawCore,
    log: LogSettings,
    engine: EngineSettings,
}

#[derive(Debug, Deserialize)]
struct RawCore {
    #[serde(default)]
    test_mode: bool,
    #[serde(default)]
    secret_key: Option<String>,
    // Resolved separately before the layered build; kept so a `core.home`
    // file entry deserializes cleanly.
    #[serde(default)]
    #[allow(dead_code)]
    home: Option<String>,
}

impl Settings {
    /// Load settings with layered precedence (see crate docs).
    ///
    /// In test mode the config file is skipped entirely so tests never touch
    /// a developer's real configuration.
    pub fn load(overrides: Overrides) -> Result<Self, SettingsError> {
        let home = match overrides.home {
            Some(home) => home,
            None => {
                let raw = std::env::var("DRIFTFLOW__CORE__HOME")
                    .unwrap_or_else(|_| DEFAULT_HOME.to_owned());
                expand_home(&raw)?
            }
        };

        let test_mode = overrides
            .test_mode
            .or_else(|| std::env::var("DRIFTFLOW__CORE__TEST_MODE").ok().map(truthy))
            .unwrap_or(false);

        let config_file = overrides
            .config_file
            .or_else(|| {
                std::env::var("DRIFTFLOW__CORE__CONFIG")
                    .ok()
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| home.join(CONFIG_FILE_NAME));

        let mut builder = Config::builder()
            .set_default("core.test_mode", false)?
            .set_default("log.level", "info")?
            .set_default("log.format", "full")?
            .set_default("engine.max_concurrency", 8i64)?
            .set_default("engine.default_retry_delay_ms", 500i64)?;

        if !test_mode {
            builder = builder.add_source(
                File::from(config_file.clone())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(level) = &overrides.log_level {
            builder = builder.set_override("log.level", level.clone())?;
        }
        if let Some(secret) = &overrides.secret_key {
            builder = builder.set_override("core.secret_key", secret.clone())?;
        }
        builder = builder.set_override("core.test_mode", test_mode)?;

        let raw: RawSettings = builder.build()?.try_deserialize()?;

        Ok(Self {
            home,
            config_file,
            test_mode: raw.core.test_mode,
            log: raw.log,
            engine: raw.engine,
            secret_key_hash: raw.core.secret_key.as_deref().map(sha256_hex),
        })
    }
}

/// Install the global `tracing` subscriber from the resolved settings.
///
/// Invoked once by the process entry point; a second call (e.g. from tests)
/// is a no-op.
pub fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_new(&settings.log.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match settings.log.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Full => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}

fn truthy(value: String) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn expand_home(path: &str) -> Result<PathBuf, SettingsError> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").map_err(|_| SettingsError::NoHomeDir)?;
            Ok(PathBuf::from(home).join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
