//! hftproxy: low-latency TCP forwarding proxy.
//!
//! Loads the rule file, serves the control port and forwards until SIGINT or
//! SIGTERM. SIGHUP reloads the rule file, keeping unchanged rules running.

use clap::Parser;
use hft_proxy::{CliOverrides, ControlServer, ProxyCoordinator, ProxyEvent, ProxySettings};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// hftproxy: low-latency TCP forwarding proxy
#[derive(Parser, Debug)]
#[command(name = "hftproxy", version, about = "Low-latency TCP forwarding proxy")]
struct Cli {
    /// Settings file path
    #[arg(long, default_value = "~/.hftproxy/config.toml")]
    config: String,

    /// Rule file to load at startup
    #[arg(short, long)]
    rules: Option<String>,

    /// Control-plane port
    #[arg(long)]
    control_port: Option<u16>,

    /// First port tried when allocating for control requests
    #[arg(long)]
    base_port: Option<u16>,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Concurrent sessions allowed per rule (0 = unbounded)
    #[arg(long)]
    max_sessions_per_rule: Option<usize>,

    /// Directory for the daily rolling log file
    #[arg(long)]
    log_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        rules: cli.rules.clone(),
        control_port: cli.control_port,
        base_port: cli.base_port,
        buffer_size: cli.buffer_size,
        max_sessions_per_rule: cli.max_sessions_per_rule,
        log_dir: cli.log_dir.clone(),
    };
    let settings = match ProxySettings::load(Some(Path::new(&cli.config)), overrides) {
        Ok(settings) => settings,
        Err(e) => {
            let _guard = init_tracing(&cli.log_level, None);
            error!(error = %e, "failed to load settings");
            std::process::exit(1);
        }
    };

    let _guard = init_tracing(&cli.log_level, settings.log_dir.as_deref());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        control_port = settings.control_port,
        base_port = settings.base_port,
        buffer_size = settings.relay.buffer_size,
        "starting hftproxy"
    );
    match &settings.loaded_from {
        Some(path) => info!(path = %path.display(), "settings file loaded"),
        None => info!(path = %cli.config, "settings file not found, using defaults"),
    }

    let coordinator = Arc::new(ProxyCoordinator::new(settings.clone()));

    let control_addr = SocketAddr::new(settings.control_bind, settings.control_port);
    let control = match ControlServer::bind(control_addr, coordinator.clone()).await {
        Ok(control) => control,
        Err(e) => {
            error!(addr = %control_addr, error = %e, "failed to bind control port");
            std::process::exit(1);
        }
    };

    tokio::spawn(log_notifications(coordinator.clone()));

    if let Some(path) = &settings.rules_path {
        load_rules(&coordinator, path).await;
    }

    let shutdown = CancellationToken::new();
    let control_task = tokio::spawn(control.run(shutdown.clone()));

    wait_for_shutdown(&coordinator).await;
    info!("received shutdown signal");

    shutdown.cancel();
    coordinator.stop_proxy().await;
    let _ = control_task.await;
    info!(uncleared_errors = coordinator.reporter().uncleared(), "hftproxy stopped");
}

/// Initialise tracing on stdout and, with a log directory, a daily rolling
/// file. The returned guard flushes the file writer on drop.
fn init_tracing(
    log_level: &str,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hftproxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

async fn load_rules(coordinator: &ProxyCoordinator, path: &Path) {
    match coordinator.load_config(path).await {
        Ok(report) if report.is_clean() => {
            info!(path = %path.display(), started = report.started.len(), "rules loaded");
        }
        Ok(report) => {
            warn!(
                path = %path.display(),
                started = report.started.len(),
                failed = report.failed.len(),
                "rules loaded with failures"
            );
        }
        Err(e) => coordinator.reporter().report("main::load_rules", &e),
    }
}

/// Log every lifecycle event and error notice with the live totals.
async fn log_notifications(coordinator: Arc<ProxyCoordinator>) {
    let mut events = coordinator.registry().subscribe();
    let mut notices = coordinator.reporter().subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let rules = coordinator.registry().rule_count();
                    let sessions = coordinator.session_count();
                    let uncleared = coordinator.reporter().uncleared();
                    match event {
                        ProxyEvent::RuleStarted(rule) => {
                            info!(%rule, rules, sessions, uncleared, "rule up")
                        }
                        ProxyEvent::RuleStopped(rule) => {
                            info!(%rule, rules, sessions, uncleared, "rule down")
                        }
                        ProxyEvent::SessionStarted { id, rule, peer } => {
                            debug!(session = id, port = rule.listening_port, peer = %peer, rules, sessions, "session up")
                        }
                        ProxyEvent::SessionStopped { id, rule } => {
                            debug!(session = id, port = rule.listening_port, rules, sessions, "session down")
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv() => match notice {
                Ok(notice) => debug!(
                    source = notice.source,
                    uncleared = coordinator.reporter().uncleared(),
                    "error notice: {}",
                    notice.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "error notices fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Wait for SIGINT or SIGTERM, reloading the rule file on every SIGHUP.
async fn wait_for_shutdown(coordinator: &ProxyCoordinator) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sighup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "signal handlers unavailable, only ctrl-c stops the proxy");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = sigterm.recv() => return,
                _ = sighup.recv() => match coordinator.refresh_config().await {
                    Ok(report) => info!(
                        started = report.started.len(),
                        stopped = report.stopped.len(),
                        kept = report.kept.len(),
                        failed = report.failed.len(),
                        "rules refreshed"
                    ),
                    Err(e) => coordinator.reporter().report("main::refresh", &e),
                },
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = coordinator;
        tokio::signal::ctrl_c().await.ok();
    }
}
