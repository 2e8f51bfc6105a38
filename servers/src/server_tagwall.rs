use anyhow::Result;
use lib_tagwall::TagHub;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod tagwall_logic;
use tagwall_logic::{config, downstream, logger, search, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Starting server_tagwall on port {}", settings.port);

    let live_feed = upstream::WsLiveFeed::new(&settings.stream_url, settings.api_token.clone())?;
    let search = search::HttpSearchClient::new(
        &settings.search_url,
        settings.api_token.clone(),
        settings.search_max_retries,
    )?;
    let hub = TagHub::start(settings.hub.clone(), Arc::new(live_feed), Arc::new(search))?;

    let shutdown = CancellationToken::new();
    let downstream_handle = tokio::spawn(downstream::run(
        settings.port,
        downstream::AppState {
            broadcaster: hub.broadcaster().clone(),
            shutdown: shutdown.clone(),
        },
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    // Close subscriber sockets first, then the workers and the live connection
    shutdown.cancel();
    match downstream_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
        Err(e) => log::error!("Downstream task ended abnormally: {}", e),
    }
    hub.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Could not install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
