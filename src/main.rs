use std::process;

use warp::Filter;

use proctor_monitor::api;
use proctor_monitor::config::Config;
use proctor_monitor::logging;
use proctor_monitor::proctoring::ConnectionManager;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    logging::init("proctor_monitor=info,warn");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            process::exit(1);
        }
    };

    let (manager, handle) = ConnectionManager::new(config.proctoring.clone());
    let monitor_task = tokio::spawn(manager.run());

    if let Err(e) = handle.connect() {
        tracing::error!(error = %e, "Could not start proctoring connection");
    }

    let routes = api::routes(handle.clone()).with(warp::trace::request());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
    };

    match warp::serve(routes).try_bind_with_graceful_shutdown(config.bind_address(), shutdown) {
        Ok((addr, server)) => {
            tracing::info!(%addr, "Dashboard API listening");
            server.await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind dashboard API");
        }
    }

    if let Err(e) = handle.shutdown() {
        tracing::debug!(error = %e, "Monitor already stopped");
    }
    if let Err(e) = monitor_task.await {
        tracing::error!(error = %e, "Monitor task panicked");
    }
}
