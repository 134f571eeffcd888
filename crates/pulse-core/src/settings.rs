use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};
use crate::models::{EnabledModes, MonitorMode};

// ── Enumerated options ─────────────────────────────────────────────────────────

/// Where the router sends normalized copies of instrumentation messages.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Ingest in-process through the local store.
    Local,
    /// POST to a remote ingestion endpoint.
    Http,
    /// Render only; nothing is persisted.
    Off,
}

/// Which targets the relay terminates when monitoring stops.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminatePolicy {
    /// Kill only processes the relay spawned itself.
    #[default]
    #[value(name = "spawned")]
    #[serde(rename = "spawned")]
    SpawnedOnly,
    /// Kill every instrumented target, attached ones included.
    All,
    /// Never kill; detach only.
    #[value(name = "none")]
    #[serde(rename = "none")]
    Never,
}

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Session and event pipeline for dynamic-instrumentation monitoring
#[derive(Parser, Debug, Clone)]
#[command(
    name = "os-pulse",
    about = "Session and event pipeline for dynamic-instrumentation monitoring",
    version
)]
pub struct Settings {
    /// Address the control plane binds to
    #[arg(long, env = "PULSE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port the control plane listens on
    #[arg(long, env = "PULSE_PORT", default_value_t = 3003)]
    pub port: u16,

    /// Base directory for the database, artifacts and config (default ~/.os-pulse)
    #[arg(long, env = "PULSE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// SQLite database path (default <data-dir>/pulse.db)
    #[arg(long, env = "PULSE_DATABASE")]
    pub database: Option<PathBuf>,

    /// Directory uploaded artifacts are stored in (default <data-dir>/artifacts)
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Comma-separated monitor modes this deployment allows
    #[arg(long, value_delimiter = ',', default_value = "attach-specific")]
    pub enabled_modes: Vec<MonitorMode>,

    /// Instrumentation bridge executable
    #[arg(long, env = "PULSE_ENGINE_COMMAND")]
    pub engine_command: Option<String>,

    /// Extra argument passed to the bridge executable (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Observer script the bridge injects into each target
    #[arg(long)]
    pub agent_script: Option<PathBuf>,

    /// Upper bound for a single spawn/attach/resume directive, in seconds
    #[arg(long, default_value_t = 30)]
    pub attach_timeout_secs: u64,

    /// Where instrumentation events are forwarded
    #[arg(long, value_enum, default_value = "local")]
    pub forward: ForwardMode,

    /// Base URL of a remote ingestion service (required with --forward http)
    #[arg(long, env = "PULSE_INGEST_ENDPOINT")]
    pub ingest_endpoint: Option<String>,

    /// Timeout for one forwarded event, in seconds
    #[arg(long, default_value_t = 10)]
    pub forward_timeout_secs: u64,

    /// Source tag stamped on forwarded events
    #[arg(long, default_value = "os-pulse-relay")]
    pub source_tag: String,

    /// Which targets are killed when monitoring stops
    #[arg(long, value_enum, default_value = "spawned")]
    pub terminate_on_stop: TerminatePolicy,

    /// Timezone applied to ingestion timestamps that carry no offset
    #[arg(long, default_value = "UTC")]
    pub default_timezone: String,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Config file path (default <data-dir>/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Persist the effective settings to the config file
    #[arg(long)]
    pub write_config: bool,
}

// ── ConfigFile ─────────────────────────────────────────────────────────────────

/// Persisted settings, merged under the command line.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_modes: Option<Vec<MonitorMode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_on_stop: Option<TerminatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl ConfigFile {
    /// `<data_dir>/config.json`.
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("config.json")
    }

    /// Load from `path`. A missing file yields the empty config.
    ///
    /// # Errors
    ///
    /// [`PulseError::Config`] when the file exists but is not valid JSON.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| PulseError::Config(format!("{}: {e}", path.display())))
    }

    /// Atomically write to `path`, creating parent directories if needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;

        // Write to a temp file then rename for atomicity.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse the process arguments and merge the config file under them.
    /// Exits with usage on a command-line error, as clap does.
    pub fn load() -> Result<Self> {
        let matches = Settings::command().get_matches();
        Self::from_matches(&matches)
    }

    /// Same as [`Settings::load`] for an explicit argument list.
    pub fn try_load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Settings::command()
            .try_get_matches_from(args)
            .map_err(|e| PulseError::Config(e.to_string()))?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &clap::ArgMatches) -> Result<Self> {
        let mut settings =
            Settings::from_arg_matches(matches).map_err(|e| PulseError::Config(e.to_string()))?;

        let config_path = settings.config_path();
        let file = ConfigFile::load_from(&config_path)?;
        settings.merge_file(file, matches);

        // --debug overrides log level.
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }

        settings.validate()?;

        if settings.write_config {
            ConfigFile::from(&settings).save_to(&config_path)?;
        }

        Ok(settings)
    }

    /// Apply values from `file` for every flag that was not given on the
    /// command line.
    fn merge_file(&mut self, file: ConfigFile, matches: &clap::ArgMatches) {
        // NOTE: clap stores the arg id using the *field name* (underscores).
        macro_rules! merge {
            (opt $field:ident) => {
                if !is_arg_explicitly_set(matches, stringify!($field)) && file.$field.is_some() {
                    self.$field = file.$field;
                }
            };
            ($field:ident) => {
                if !is_arg_explicitly_set(matches, stringify!($field)) {
                    if let Some(v) = file.$field {
                        self.$field = v;
                    }
                }
            };
        }

        merge!(host);
        merge!(port);
        merge!(opt database);
        merge!(opt artifact_dir);
        merge!(enabled_modes);
        merge!(opt engine_command);
        merge!(engine_args);
        merge!(opt agent_script);
        merge!(attach_timeout_secs);
        merge!(forward);
        merge!(opt ingest_endpoint);
        merge!(forward_timeout_secs);
        merge!(source_tag);
        merge!(terminate_on_stop);
        merge!(default_timezone);
        merge!(log_level);
        merge!(opt log_file);
    }

    /// Reject combinations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.forward == ForwardMode::Http && self.ingest_endpoint.is_none() {
            return Err(PulseError::Config(
                "--forward http requires --ingest-endpoint".to_string(),
            ));
        }
        if self.enabled_modes.is_empty() {
            return Err(PulseError::Config(
                "at least one monitor mode must be enabled".to_string(),
            ));
        }
        if self.attach_timeout_secs == 0 || self.forward_timeout_secs == 0 {
            return Err(PulseError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    // ── Derived paths and values ───────────────────────────────────────────────

    /// Base data directory, `~/.os-pulse` unless overridden.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".os-pulse")
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| ConfigFile::path_in(&self.data_dir()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir().join("pulse.db"))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("artifacts"))
    }

    pub fn enabled_modes(&self) -> EnabledModes {
        EnabledModes::new(self.enabled_modes.iter().copied())
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Conversion ─────────────────────────────────────────────────────────────────

impl From<&Settings> for ConfigFile {
    fn from(s: &Settings) -> Self {
        ConfigFile {
            host: Some(s.host.clone()),
            port: Some(s.port),
            database: s.database.clone(),
            artifact_dir: s.artifact_dir.clone(),
            enabled_modes: Some(s.enabled_modes.clone()),
            engine_command: s.engine_command.clone(),
            engine_args: Some(s.engine_args.clone()),
            agent_script: s.agent_script.clone(),
            attach_timeout_secs: Some(s.attach_timeout_secs),
            forward: Some(s.forward),
            ingest_endpoint: s.ingest_endpoint.clone(),
            forward_timeout_secs: Some(s.forward_timeout_secs),
            source_tag: Some(s.source_tag.clone()),
            terminate_on_stop: Some(s.terminate_on_stop),
            default_timezone: Some(s.default_timezone.clone()),
            log_level: Some(s.log_level.clone()),
            log_file: s.log_file.clone(),
        }
    }
}

// ── Helper: check if an arg was explicitly set on the command line ─────────────

/// Returns `true` when `name` was supplied explicitly on the command line
/// (not via default value or environment variable).
fn is_arg_explicitly_set(matches: &clap::ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(clap::parser::ValueSource::CommandLine)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
