use std::{fs::OpenOptions, net::SocketAddr, path::Path, sync::Arc};

use eyre::{Result, WrapErr};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt::writer::BoxMakeWriter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::models::{LogConfig, LogFormat};

/// Where log lines go, from the `output` setting
enum LogOutput {
    None,
    Writer(BoxMakeWriter),
}

fn log_output(output: &str) -> Result<LogOutput> {
    Ok(match output {
        "none" | "null" => LogOutput::None,
        "stdout" => LogOutput::Writer(BoxMakeWriter::new(std::io::stdout)),
        "stderr" | "" => LogOutput::Writer(BoxMakeWriter::new(std::io::stderr)),
        path => {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .wrap_err_with(|| format!("Failed to create log directory {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("Failed to open log file {path}"))?;
            LogOutput::Writer(BoxMakeWriter::new(Arc::new(file)))
        }
    })
}

/// `RUST_LOG` when set, otherwise the configured level.
fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

fn fmt_layer(
    config: &LogConfig,
    writer: BoxMakeWriter,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);

    match (config.format, config.time) {
        (LogFormat::Json, true) => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(filter)
            .boxed(),
        (LogFormat::Json, false) => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .without_time()
            .with_filter(filter)
            .boxed(),
        (LogFormat::Text, true) => layer.with_ansi(false).with_filter(filter).boxed(),
        (LogFormat::Text, false) => layer
            .with_ansi(false)
            .without_time()
            .with_filter(filter)
            .boxed(),
    }
}

/// Initialize logging from the `log` section.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;
    let LogOutput::Writer(writer) = log_output(&config.output)? else {
        return Ok(());
    };

    Registry::default()
        .with(fmt_layer(config, writer, filter))
        .try_init()
        .wrap_err("Failed to install the tracing subscriber")?;

    tracing::debug!(
        "hopgate logging initialized: level={}, format={:?}, output={}",
        config.level,
        config.format,
        config.output
    );
    Ok(())
}

/// Span covering one forwarded connection
pub fn connection_span(service: &str, peer: SocketAddr, destination: &str) -> tracing::Span {
    tracing::info_span!(
        "conn",
        service = service,
        peer = %peer,
        dst = destination,
    )
}
