//! Audio Sender Application
//!
//! Publishes a sine tone into a shared ring and announces it on the LAN.
//! Usage: `sender [config.toml] [frequency_hz]`

use anyhow::{Context, Result};
use std::f32::consts::TAU;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shared_audio_bus::{
    config::AppConfig,
    peers::{Producer, ProducerEvent},
};

/// Phase-continuous sine generator, one phase per channel
struct Tone {
    frequency: f32,
    sample_rate: f32,
    phases: Vec<f32>,
}

impl Tone {
    fn new(frequency: f32, sample_rate: f32, channels: usize) -> Self {
        Self {
            frequency,
            sample_rate,
            phases: vec![0.0; channels],
        }
    }

    /// Fill a planar buffer. Channel `c` is detuned by `c` percent.
    fn fill(&mut self, out: &mut [f32], frames: usize) {
        for (c, phase) in self.phases.iter_mut().enumerate() {
            let step = TAU * self.frequency * (1.0 + c as f32 * 0.01) / self.sample_rate;
            for sample in &mut out[c * frames..(c + 1) * frames] {
                *sample = phase.sin() * 0.2;
                *phase = (*phase + step) % TAU;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting shared audio sender");

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let frequency: f32 = match args.next() {
        Some(f) => f.parse().context("frequency must be a number")?,
        None => 440.0,
    };

    let config = AppConfig::load_or_default(config_path.as_deref())?;
    let mut producer = Producer::open(&config.producer, &config.discovery)?;
    let format = producer.format();
    let events = producer.events();

    tracing::info!(
        "Publishing {} Hz tone on {} (announcing to {})",
        frequency,
        producer.segment_id(),
        config.discovery.announce_target()
    );

    let mut tone = Tone::new(frequency, format.sample_rate as f32, format.channels as usize);
    let frames = format.frames_per_buffer as usize;

    let mut audio_timer = tokio::time::interval(format.buffer_duration());
    audio_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    let mut stats_timer = tokio::time::interval(std::time::Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = audio_timer.tick() => {
                tone.fill(producer.write_buffer(), frames);
                if let Err(e) = producer.publish() {
                    tracing::error!("Publish failed: {}", e);
                    break;
                }
                producer.tick();

                for event in events.try_iter() {
                    match event {
                        ProducerEvent::PeerRegistered(addr) => {
                            tracing::info!("Consumer at {} registered", addr);
                        }
                        ProducerEvent::Command { from, text } => {
                            tracing::info!("Command from {}: {}", from, text);
                        }
                    }
                }
            }
            _ = stats_timer.tick() => {
                tracing::info!(
                    "Published {} buffers, {} consumers registered",
                    producer.published(),
                    producer.peers().len()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    producer.close();
    Ok(())
}
