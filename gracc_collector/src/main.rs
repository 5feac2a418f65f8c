//! Entry point: loads configuration, starts the broker session and the
//! stats bus, and serves the HTTP dispatcher. Mirrors the teacher's
//! `Api::run_server` shape.

mod broker;
mod bundle;
mod config;
mod encoder;
mod error;
mod http;
mod quarantine;
mod scanner;
mod stats;

use actix_web::{web, App, HttpServer};
use tracing_subscriber::EnvFilter;

use crate::http::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match config::load_defaults() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "error loading configuration");
            std::process::exit(1);
        }
    };

    let broker = match broker::BrokerSession::start(config.broker.clone()).await {
        Ok(broker) => broker,
        Err(err) => {
            tracing::error!(error = %err, "error starting broker session");
            std::process::exit(1);
        }
    };

    let (stats, _stats_handle) = stats::StatsBus::spawn(1024);

    let state = AppState {
        broker,
        stats,
        scan_limits: scanner::ScanLimits {
            start_buffer_size: config.scanner_start_buffer_size,
            max_buffer_size: config.scanner_max_buffer_size,
        },
        wait_timeout: config.wait_timeout,
    };

    let stats_path = config.stats_path.clone();
    let binds = config.http_binds.clone();

    tracing::info!(?binds, stats_path = %stats_path, "starting gracc collector");

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/", web::post().to(http::update))
            .route(&stats_path, web::get().to(http::stats))
    });

    for bind in &binds {
        server = server.bind(bind)?;
    }

    server.run().await
}
