use color_eyre::Result;
use lazy_static::lazy_static;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config;

lazy_static! {
    pub static ref LOG_ENV: String = format!("{}_LOGLEVEL", config::PROJECT_NAME.clone());
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

/// `RUST_LOG` wins over `SRPICO_LOGLEVEL`; `default` applies when neither is set.
fn filter(default: tracing::Level) -> Result<EnvFilter> {
    let env_filter = EnvFilter::builder().with_default_directive(default.into());
    Ok(env_filter
        .try_from_env()
        .or_else(|_| env_filter.with_env_var(LOG_ENV.clone()).from_env())?)
}

/// Debug detail goes to the log file in the data directory, warnings and errors to stderr.
pub fn init() -> Result<()> {
    let directory = config::get_data_dir();
    std::fs::create_dir_all(directory.clone())?;
    let log_path = directory.join(LOG_FILE.clone());
    let log_file = std::fs::File::create(log_path)?;

    let file_subscriber = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .with_target(false)
        .with_ansi(false)
        .with_filter(filter(tracing::Level::INFO)?);
    let stderr_subscriber = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter(tracing::Level::WARN)?);

    tracing_subscriber::registry()
        .with(file_subscriber)
        .with(stderr_subscriber)
        .with(ErrorLayer::default())
        .try_init()?;
    Ok(())
}
