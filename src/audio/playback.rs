//! Output stream that mixes live peer connections
//!
//! The cpal stream lives on its own thread. Its callback reads the current
//! connection list with `try_lock` and mixes whatever is ready; if the list
//! is being swapped it plays one buffer of silence instead of waiting.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::output_device;
use crate::audio::mixer::mix_into;
use crate::error::AudioError;
use crate::peers::PeerConnection;

/// Connection list shared with the audio callback
pub type PlaybackSources = Arc<Mutex<Vec<Arc<PeerConnection>>>>;

pub struct AudioPlayback {
    device_id: Option<String>,
    config: StreamConfig,
    sources: PlaybackSources,
    running: Arc<AtomicBool>,
    callbacks: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl AudioPlayback {
    /// Playback at `sample_rate`. Channel count defaults to the device's.
    pub fn new(
        device_id: Option<&str>,
        sample_rate: u32,
        channels: Option<u16>,
        sources: PlaybackSources,
    ) -> Result<Self, AudioError> {
        let device = output_device(device_id)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

        let config = StreamConfig {
            channels: channels.unwrap_or(default_config.channels()),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device_id: device_id.map(str::to_string),
            config,
            sources,
            running: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
            error_rx: None,
        })
    }

    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = output_device(self.device_id.as_deref())?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let stream_error_tx = error_tx.clone();
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let sources = self.sources.clone();
        let callbacks = self.callbacks.clone();
        let skipped = self.skipped.clone();
        let config = self.config.clone();
        let channels = self.config.channels as usize;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callbacks.fetch_add(1, Ordering::Relaxed);
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        match sources.try_lock() {
                            Some(list) => mix_into::<PeerConnection, _>(list.iter(), data, channels),
                            None => {
                                skipped.fetch_add(1, Ordering::Relaxed);
                                data.fill(0.0);
                            }
                        }
                    },
                    move |err| {
                        let _ = stream_error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start output stream: {}", e);
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to build output stream: {}", e);
                        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(
            "Playback started: {} Hz, {} channels",
            self.config.sample_rate.0,
            self.config.channels
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Callbacks run so far
    pub fn callback_count(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    /// Callbacks that played silence because the list was locked
    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
