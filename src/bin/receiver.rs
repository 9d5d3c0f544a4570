//! Audio Receiver Application
//!
//! Discovers producers, mixes their streams to the default output device and
//! serves a JSON status API.
//! Usage: `receiver [config.toml]`

use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shared_audio_bus::{
    audio::{list_output_devices, AudioPlayback, PlaybackSources},
    config::AppConfig,
    peers::{DiscoveryRegistry, RegistryEvent},
    ui::WebServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting shared audio receiver");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let registry = Arc::new(DiscoveryRegistry::start(
        config.discovery.clone(),
        config.consumer.clone(),
    )?);
    let events = registry.events();

    // Playback is optional: a headless host still serves the status API
    let sources: PlaybackSources = Arc::new(Mutex::new(Vec::new()));
    let mut playback = match AudioPlayback::new(
        None,
        config.consumer.required_sample_rate,
        None,
        sources.clone(),
    ) {
        Ok(mut playback) => match playback.start() {
            Ok(()) => Some(playback),
            Err(e) => {
                tracing::error!("Failed to start playback: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("No output device, running without playback: {}", e);
            None
        }
    };

    let (shutdown_tx, _shutdown_rx) = tokio::sync::watch::channel(false);
    let web_handle = if config.ui.enabled {
        let addr: SocketAddr = format!("{}:{}", config.ui.bind_address, config.ui.http_port).parse()?;
        let server = WebServer::new(registry.clone(), config.consumer.required_sample_rate);
        let mut rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = server.run(addr, shutdown).await {
                tracing::error!("Status API stopped: {}", e);
            }
        }))
    } else {
        None
    };

    tracing::info!("Waiting for producers on {}...", registry.local_addr());

    let mut refresh = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = refresh.tick() => {
                // Swap in the current table; old Arcs drop here, not in the callback
                let current: Vec<_> = registry.connections().into_values().collect();
                *sources.lock() = current;

                for event in events.try_iter() {
                    match event {
                        RegistryEvent::Connected { name, stream_name, format } => {
                            tracing::info!(
                                "{} ({}) connected: {} Hz, {} channels",
                                name, stream_name, format.sample_rate, format.channels
                            );
                        }
                        RegistryEvent::Disconnected { name, reason } => {
                            tracing::info!("{} disconnected: {:?}", name, reason);
                        }
                        RegistryEvent::Command { name, text } => {
                            tracing::info!("Command from {}: {}", name, text);
                        }
                    }
                }

                if let Some(err) = playback.as_ref().and_then(|p| p.check_errors()) {
                    tracing::warn!("Playback error: {}", err);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = web_handle {
        let _ = handle.await;
    }
    if let Some(playback) = playback.as_mut() {
        playback.stop();
    }
    sources.lock().clear();
    registry.close();
    Ok(())
}
