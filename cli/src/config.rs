//! Layered settings for the capture tool.
//!
//! Built-in defaults are overlaid by an optional config file in the project
//! config directory, then by `SRPICO_*` environment variables (nested keys use
//! `__`, e.g. `SRPICO_CAPTURE__SAMPLE_RATE`), then by command-line flags.

use std::{env, path::PathBuf, time::Duration};

use color_eyre::Result;
use config::FileFormat;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use srpico_host::{CaptureSettings, PatternTrigger, RESPONSE_TIMEOUT, STOP_DRAIN_TIMEOUT};

use crate::cli::{CaptureArgs, Cli};
use crate::output::OutputFormat;

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase();
    pub static ref DATA_FOLDER: Option<PathBuf> = env::var(format!("{}_DATA", PROJECT_NAME.clone()))
        .ok()
        .map(PathBuf::from);
    pub static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_CONFIG", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
}

const CONFIG_FILES: [(&str, FileFormat); 4] = [
    ("config.toml", FileFormat::Toml),
    ("config.json5", FileFormat::Json5),
    ("config.json", FileFormat::Json),
    ("config.yaml", FileFormat::Yaml),
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    /// Silence that marks the end of a reply or of a drain.
    pub quiet_ms: u64,
    pub stop_drain_ms: u64,
    pub format: OutputFormat,
    pub trigger: Option<String>,
    pub capture: CaptureSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            response_timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
            quiet_ms: 20,
            stop_drain_ms: STOP_DRAIN_TIMEOUT.as_millis() as u64,
            format: OutputFormat::Csv,
            trigger: None,
            capture: CaptureSettings::default(),
        }
    }
}

impl Config {
    /// Defaults, then the config file, then the environment.
    pub fn new() -> Result<Self> {
        let config_dir = get_config_dir();
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        for (file, format) in CONFIG_FILES {
            builder = builder.add_source(
                config::File::from(config_dir.join(file))
                    .format(format)
                    .required(false),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(&PROJECT_NAME)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Flags given on the command line win over every other layer.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = &cli.port {
            self.port = Some(port.clone());
        }
        if let Some(baud) = cli.baud {
            self.baud_rate = baud;
        }
    }

    pub fn apply_capture(&mut self, args: &CaptureArgs) {
        let capture = &mut self.capture;
        if let Some(rate) = args.rate {
            capture.sample_rate = rate;
        }
        if let Some(limit) = args.limit {
            capture.sample_limit = limit;
        }
        if let Some(digital) = args.digital {
            capture.digital_channels = digital;
        }
        if let Some(analog) = args.analog {
            capture.analog_channels = analog;
        }
        if let Some(ratio) = args.pretrigger {
            capture.pretrigger_ratio = ratio;
        }
        capture.continuous |= args.continuous;
        if let Some(format) = args.format {
            self.format = format;
        }
        if let Some(trigger) = &args.trigger {
            self.trigger = Some(trigger.to_string());
        }
    }

    pub fn trigger(&self) -> Result<Option<PatternTrigger>> {
        Ok(self.trigger.as_deref().map(str::parse).transpose()?)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    pub fn stop_drain(&self) -> Duration {
        Duration::from_millis(self.stop_drain_ms)
    }
}

/// Directory for the log file.
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = DATA_FOLDER.clone() {
        return dir;
    }
    project_directory()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(default_data_dir)
}

/// Directory searched for `config.{toml,json5,json,yaml}`.
pub fn get_config_dir() -> PathBuf {
    if let Some(dir) = CONFIG_FOLDER.clone() {
        return dir;
    }
    project_directory()
        .map(|dirs| dirs.config_local_dir().to_path_buf())
        .unwrap_or_else(default_config_dir)
}

fn project_directory() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "srpico", env!("CARGO_PKG_NAME"))
}

fn default_data_dir() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".data")
}

fn default_config_dir() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config")
}
