use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use meshgate_backend::{
    logging, routes, store, AppState, Config, ExpirySweeper, JwksClient, Reconciler, SystemClock,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    logging::init(&config.logging);

    tracing::info!("Starting meshgate coordination server");

    if config.oidc.resolve_client_secret()?.is_some() {
        tracing::info!("OIDC client secret loaded for client {}", config.oidc.client_id);
    }

    let store = store::open(&config.database.url)?;
    let reconciler = Arc::new(Reconciler::new(store, Arc::new(SystemClock), &config.oidc));
    reconciler.restore_sessions()?;

    let verifier = Arc::new(JwksClient::new(&config.oidc.issuer).await?);

    let sweeper = ExpirySweeper::new(
        reconciler.clone(),
        Duration::from_secs(config.session.sweep_interval_secs.max(1)),
    );
    let stop_sweeper = sweeper.shutdown_handle();
    let sweeper_task = tokio::spawn(async move { sweeper.run().await });

    let state = Arc::new(AppState {
        config: config.clone(),
        verifier,
        reconciler,
    });
    let app = routes::app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    stop_sweeper.notify_one();
    sweeper_task.await?;

    Ok(())
}
