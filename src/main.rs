mod collectors;
mod config;
mod events;
mod http;
mod metrics;
mod poller;
mod report;
mod sample;
mod tracking;

use axum::serve;
use clap::Parser;
use collectors::system::SystemSource;
use collectors::{gpu, sensors, SampleAggregator};
use config::Config;
use events::EventBus;
use http::HttpAppState;
use metrics::Metrics;
use poller::{LatestSample, Poller};
use report::render::ReportStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracking::TrackingSession;

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_or_default(&cli.config) {
        Ok((cfg, true)) => cfg,
        Ok((cfg, false)) => {
            warn!(path = %cli.config, "config file not found, using built-in defaults");
            cfg
        }
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --listen override");
            std::process::exit(1);
        }
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        duration_secs = cfg.tracking.duration_secs,
        "starting hostwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };
    let session = TrackingSession::new(Duration::from_secs(cfg.tracking.duration_secs));
    let bus = EventBus::new(cfg.stream.buffer);
    let latest: LatestSample = Arc::new(RwLock::new(None));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let state = HttpAppState {
            metrics: metrics.clone(),
            session: session.clone(),
            bus: bus.clone(),
            latest: latest.clone(),
            reports: ReportStore::new(cfg.reports.dir.clone()),
            min_report_samples: cfg.tracking.min_report_samples,
            report_timeout: Duration::from_secs(cfg.reports.timeout_secs),
        };
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(%addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let poller_task = {
        let source = tokio::task::spawn_blocking(|| {
            SystemSource::new(gpu::detect(), sensors::platform_backend())
        })
        .await;
        let source = match source {
            Ok(source) => source,
            Err(err) => {
                error!(error = %err, "failed to initialise metric source");
                std::process::exit(1);
            }
        };
        let poller = Poller::new(
            SampleAggregator::new(source, cfg.processes.top_n),
            session.clone(),
            bus.clone(),
            metrics.clone(),
            latest.clone(),
            cfg.interval(),
            cfg.collect_timeout(),
        );
        tokio::spawn(poller.run(shutdown_rx.clone()))
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = poller_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
