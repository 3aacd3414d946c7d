use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gateway=info,quotagate_internal=info"))
}

fn debug_env_filter() -> EnvFilter {
    EnvFilter::new("warn,gateway=debug,quotagate_internal=debug")
}

/// Handle for raising the log level after the config file has been parsed.
///
/// Logging must come up before config loading so load failures are visible,
/// which means `gateway.debug` can only take effect retroactively.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        self.handle.reload(debug_env_filter()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to enable debug logs: {e}"),
            })
        })
    }
}

/// Set up logging for the gateway. `RUST_LOG` overrides the default filter.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let (filter, handle) = reload::Layer::new(default_env_filter());
    let base = tracing_subscriber::registry().with(filter);

    let init_result = match log_format {
        LogFormat::Pretty => base.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => base
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    init_result.map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to initialize tracing subscriber: {e}"),
        })
    })?;

    Ok(DelayedDebugLogs { handle })
}

/// Install the Prometheus metrics recorder and return the render handle
/// served at `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to install Prometheus metrics exporter: {e}"),
        })
    })
}
