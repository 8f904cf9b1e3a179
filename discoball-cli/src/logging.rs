use std::{num::NonZeroUsize, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Filter used for the terminal when `RUST_LOG` is not set.
const DEFAULT_TERMINAL_FILTER: &str = "discoball=info";

/// Initialize logging both in the terminal and file based.
///
/// The terminal layer logs to [`std::io::Stderr`], filtered by `RUST_LOG`.
///
/// The file layer:
/// - includes line numbers and does not use ansi colors.
/// - creates log files in the `logs` dir inside the given data root.
/// - rotates files every [`FileLogging::rotation`], keeping at most
///   [`FileLogging::max_files`] of them.
/// - uses the filtering defined by [`FileLogging::rust_log`].
/// - names files `discoball-<ROTATION_BASED_NAME>.log` (ex: discoball-2024-02-02.log)
pub(crate) fn init_terminal_and_file_logging(
    file_log_config: &FileLogging,
    data_root: &Path,
) -> anyhow::Result<non_blocking::WorkerGuard> {
    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter());
    let (file_layer, guard) = {
        let FileLogging {
            rust_log,
            max_files,
            rotation,
        } = file_log_config;

        let (file_logger, guard) = {
            let rotation = match rotation {
                Rotation::Hourly => rolling::Rotation::HOURLY,
                Rotation::Daily => rolling::Rotation::DAILY,
                Rotation::Never => rolling::Rotation::NEVER,
            };
            let logs_path = data_root.join("logs");

            let file_appender = rolling::Builder::new()
                .rotation(rotation)
                .max_log_files(max_files.get())
                .filename_prefix("discoball")
                .filename_suffix("log")
                .build(logs_path)?;
            non_blocking(file_appender)
        };

        let layer = fmt::Layer::new()
            .with_ansi(false)
            .with_line_number(true)
            .with_writer(file_logger)
            .with_filter(rust_log.layer());
        (layer, guard)
    };
    tracing_subscriber::registry()
        .with(file_layer)
        .with(terminal_layer)
        .try_init()?;
    Ok(guard)
}

/// Initialize logging in the terminal only.
pub(crate) fn init_terminal_logging() -> anyhow::Result<()> {
    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter());
    tracing_subscriber::registry()
        .with(terminal_layer)
        .try_init()?;
    Ok(())
}

fn terminal_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_TERMINAL_FILTER))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileLogging {
    /// RUST_LOG directive to filter file logs.
    pub(crate) rust_log: EnvFilter,
    /// Maximum number of files to keep.
    pub(crate) max_files: NonZeroUsize,
    /// How often should a new log file be produced.
    pub(crate) rotation: Rotation,
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            rust_log: EnvFilter::default(),
            max_files: NonZeroUsize::new(8).expect("clearly non zero"),
            rotation: Rotation::default(),
        }
    }
}

/// Wrapper to obtain a [`tracing_subscriber::EnvFilter`] that satisfies required bounds.
#[derive(
    Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr, derive_more::Display,
)]
#[display("{_0}")]
pub(crate) struct EnvFilter(String);

impl FromStr for EnvFilter {
    type Err = <tracing_subscriber::EnvFilter as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // validate the RUST_LOG statement
        let _valid_env = tracing_subscriber::EnvFilter::from_str(s)?;
        Ok(EnvFilter(s.into()))
    }
}

impl Default for EnvFilter {
    fn default() -> Self {
        Self("discoball=debug,info".into())
    }
}

impl EnvFilter {
    pub(crate) fn layer(&self) -> tracing_subscriber::EnvFilter {
        tracing_subscriber::EnvFilter::from_str(&self.0).expect("validated RUST_LOG statement")
    }
}

/// How often a new file is created for file logs.
/// Akin to [`tracing_appender::rolling::Rotation`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Rotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_rejected() {
        assert!(EnvFilter::from_str("discoball=trace").is_ok());
        assert!(EnvFilter::from_str("discoball=loud").is_err());
    }
}
