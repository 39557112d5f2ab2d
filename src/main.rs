use std::{sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use hopgate::{
    adapters::TcpTransport,
    config::{
        Config, FlagOptions, load_config,
        loader::log_config,
        merge_flags,
        models::{LogConfig, RuntimeConfig},
    },
    core::{Registries, build, reload_hosts, spawn_limiter_maintenance},
    metrics, tracing_setup,
    utils::{
        graceful_shutdown::{GracefulShutdown, ShutdownReason},
        supervisor::{split_worker_args, supervise},
    },
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[clap(short = 'C', long = "config")]
    config: Option<String>,

    /// Listen port, bound on 127.0.0.1 and [::1] for TCP and UDP
    #[clap(short = 'P')]
    listen_port: Option<u16>,

    /// Proxy server to forward the traffic to, e.g. http://192.168.0.1:3128
    #[clap(short = 'F')]
    forward: Option<String>,

    /// Run in TPROXY mode instead of REDIRECT
    #[clap(short = 'T')]
    tproxy: bool,

    /// SO_MARK to set on outgoing connections
    #[clap(short = 'M')]
    mark: Option<u32>,

    /// Enable debug logging
    #[clap(short = 'D')]
    debug: bool,

    /// Do not add timestamps to logs
    #[clap(long = "no-log-time")]
    no_log_time: bool,

    /// Print the merged configuration and exit
    #[clap(short = 'O', value_enum)]
    output: Option<OutputFormat>,
}

impl Args {
    fn flags(&self) -> FlagOptions {
        FlagOptions {
            listen_port: self.listen_port,
            forward: self.forward.clone(),
            tproxy: self.tproxy,
            mark: self.mark,
            debug: self.debug,
            no_log_time: self.no_log_time,
        }
    }

    async fn load(&self) -> Result<Config> {
        let file = match &self.config {
            Some(path) => load_config(path)
                .await
                .with_context(|| format!("Failed to load config from {path}"))?,
            None => Config::default(),
        };
        merge_flags(file, &self.flags())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if let Some(groups) = split_worker_args(&raw) {
        let code = run_supervisor(groups).await?;
        std::process::exit(code);
    }

    let args = Args::parse();
    let config = args.load().await?;

    if let Some(OutputFormat::Json) = args.output {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if config.is_empty() {
        bail!("Nothing to serve: pass -C <config> or -P <port> (optionally with -F <proxy url>)");
    }

    tracing_setup::init_tracing(&log_config(&config))?;
    metrics::init_metrics();

    let runtime = config.runtime.clone().unwrap_or_default();
    let (drain_timeout, limiter_gc_interval) = runtime_timings(&runtime)?;

    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(drain_timeout));
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    // cancelled only after the drain window, not by the signal itself
    let services_token = CancellationToken::new();
    let registries = match build(&config, &TcpTransport, &services_token).await {
        Ok(registries) => Arc::new(registries),
        Err(e) => {
            graceful_shutdown.trigger_shutdown(ShutdownReason::Force);
            return Err(e.wrap_err("Failed to start services"));
        }
    };

    for (name, service) in registries.services.get_all() {
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.serve().await {
                tracing::error!(service = %name, "service failed: {e}");
            }
        });
    }

    spawn_reloader(&args, registries.clone(), graceful_shutdown.clone());
    let maintenance = spawn_limiter_maintenance(
        registries.clone(),
        limiter_gc_interval,
        graceful_shutdown.token(),
    );

    graceful_shutdown.wait_for_shutdown_signal().await;
    shutdown_services(&registries, graceful_shutdown.drain_timeout()).await;
    services_token.cancel();
    if let Err(e) = maintenance.await {
        tracing::warn!("Limiter maintenance task ended abnormally: {e}");
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

fn runtime_timings(runtime: &RuntimeConfig) -> Result<(Duration, Duration)> {
    let drain = humantime::parse_duration(&runtime.drain_timeout)
        .with_context(|| format!("Invalid runtime.drain_timeout '{}'", runtime.drain_timeout))?;
    let gc = humantime::parse_duration(&runtime.limiter_gc_interval).with_context(|| {
        format!(
            "Invalid runtime.limiter_gc_interval '{}'",
            runtime.limiter_gc_interval
        )
    })?;
    if gc.is_zero() {
        bail!("runtime.limiter_gc_interval must be greater than zero");
    }
    Ok((drain, gc))
}

/// Reload host tables from the config file on SIGHUP.
fn spawn_reloader(args: &Args, registries: Arc<Registries>, shutdown: Arc<GracefulShutdown>) {
    let Some(path) = args.config.clone() else {
        return;
    };
    let flags = args.flags();
    let mut reload_rx = shutdown.subscribe_reload();
    let token = shutdown.token();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = reload_rx.recv() => {
                    if received.is_err() {
                        break;
                    }
                }
            }

            tracing::info!("Reloading host tables from {path}");
            let reloaded = match load_config(&path).await {
                Ok(file) => merge_flags(file, &flags)
                    .and_then(|config| reload_hosts(&registries, &config)),
                Err(e) => Err(e),
            };
            match reloaded {
                Ok(count) => tracing::info!("Reloaded {count} host table(s)"),
                Err(e) => {
                    tracing::error!("Failed to reload configuration: {e:#}. Keeping old host tables.")
                }
            }
        }
    });
}

/// Stop accepting, let connections drain, then cancel the stragglers.
///
/// Connection tokens descend from a token the signal does not touch, so open
/// connections keep relaying for up to `drain_timeout`.
async fn shutdown_services(registries: &Registries, drain_timeout: Duration) {
    let services = registries.services.get_all();
    for (_, service) in &services {
        service.stop_accepting();
    }

    let mut drained = true;
    for (name, service) in &services {
        if !service.drain(drain_timeout).await {
            tracing::warn!(service = %name, "connections still open after {drain_timeout:?}");
            drained = false;
        }
        service.close();
    }
    if !drained {
        tracing::warn!("Forced shutdown of remaining connections");
    }
}

async fn run_supervisor(groups: Vec<Vec<String>>) -> Result<i32> {
    tracing_setup::init_tracing(&LogConfig::default())?;

    let program = std::env::current_exe().context("Failed to locate the hopgate executable")?;
    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    tracing::info!("Starting {} workers", groups.len());
    let code = supervise(program, groups, &shutdown.token()).await?;
    Ok(code)
}
