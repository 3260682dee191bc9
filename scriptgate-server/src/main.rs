use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use scriptgate_server::cleanup::start_cleanup_task;
use scriptgate_server::config::{CliArgs, ServerConfig};
use scriptgate_server::mount;
use scriptgate_server::request::upload_directory;
use tokio::signal;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .filter(Some("tower_http"), LevelFilter::Debug)
        .filter(
            Some("scriptgate_server"),
            if args.debug {
                LevelFilter::Trace
            } else {
                LevelFilter::Debug
            },
        )
        .parse_default_env()
        .init();

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        api_version = scriptgate_api::api::VERSION;
        "Initializing server"
    );

    // Configuration errors are fatal.
    let config = match ServerConfig::try_from(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!(e:display; "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    log::debug!(config:debug; "configuration");

    let router = match mount::router(&config) {
        Ok(router) => router.layer(TraceLayer::new_for_http()),
        Err(e) => {
            log::error!(e:display; "failed to mount commands");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(upload_directory()).await {
        log::error!(e:display; "cannot create the upload directory");
        return ExitCode::FAILURE;
    }
    start_cleanup_task(Duration::from_secs(args.upload_max_age));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!(addr:display, e:display; "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        addr:display = args.host,
        port = args.port.get();
        "listening to TCP"
    );

    if let Err(e) = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!(e:display; "server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT (ctrl+c) handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("received SIGINT (ctrl+c), shutting down"),
        () = terminate => log::info!("received SIGTERM, shutting down"),
    }
}
