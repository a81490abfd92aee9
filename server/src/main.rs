use clap::Parser;
use log::{error, info};
use server::config::Args;
use server::game::Game;
use server::meta::MetaServer;
use server::network::NetworkServer;
use server::registry::ConnectionRegistry;
use server::shutdown::ShutdownCoordinator;
use server::simulation;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!(
        "Starting server on {} at {}Hz (registry {})",
        config.bind_addr, config.tick_rate, config.registry_url
    );

    let shutdown = CancellationToken::new();
    let (joins, join_receiver) = simulation::channel(config.network.join_capacity);
    let registry = Arc::new(ConnectionRegistry::new(
        config.network.clone(),
        config.verifier(),
        joins,
        shutdown.clone(),
    ));
    let server = NetworkServer::bind(&config.bind_addr, Arc::clone(&registry), shutdown.clone()).await?;
    let meta = MetaServer::bind(&config.meta_addr, shutdown.clone()).await?;

    let game = Game::new(join_receiver, config.tick_rate, shutdown.clone())
        .with_message_budget(config.network.inbound_capacity);
    let game_handle = tokio::spawn(game.run());
    let meta_handle = tokio::spawn(async move { meta.start().await });
    let shutdown_handle = tokio::spawn(
        ShutdownCoordinator::new(Arc::clone(&registry), config.network.shutdown_grace)
            .run(shutdown.clone()),
    );
    let mut server_handle = tokio::spawn(async move { server.start().await });

    let server_result = tokio::select! {
        result = &mut server_handle => Some(result),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
            None
        }
    };
    shutdown.cancel();

    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await,
    };
    match server_result {
        Ok(Err(e)) => error!("Network server failed: {}", e),
        Err(e) => error!("Network task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    match meta_handle.await {
        Ok(Err(e)) => error!("Meta endpoint failed: {}", e),
        Err(e) => error!("Meta task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    match shutdown_handle.await {
        Ok(report) => info!(
            "Shutdown complete: {} connections closed, {} tasks abandoned",
            report.closed, report.abandoned
        ),
        Err(e) => error!("Shutdown task panicked: {}", e),
    }
    if let Err(e) = game_handle.await {
        error!("Game loop task panicked: {}", e);
    }

    Ok(())
}
