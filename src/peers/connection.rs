//! Consumer-side connection to one producer
//!
//! Attaching happens synchronously when the first announcement arrives.
//! A polling thread then owns the ring reader: it reads each new slot,
//! resamples every channel to the local rate, and pushes the interleaved
//! result into the sample queue that the audio callback drains.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::RegistryEvent;
use crate::audio::mixer::SampleSource;
use crate::audio::queue::{OverflowPolicy, SampleQueue};
use crate::audio::resample::{build_resampler, resampled_len, Resampler};
use crate::audio::ring::{RingLayout, RingReader};
use crate::config::ConsumerConfig;
use crate::error::{NetworkError, PeerError};
use crate::network::udp;
use crate::protocol::{Announcement, ControlMessage, StreamFormat};
use crate::shm::SegmentId;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Announced,
    Attaching,
    Active,
    Stale,
    Closed,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Announced,
            1 => PeerState::Attaching,
            2 => PeerState::Active,
            3 => PeerState::Stale,
            _ => PeerState::Closed,
        }
    }
}

/// State shared with the polling thread
struct Shared {
    running: AtomicBool,
    ready: AtomicBool,
    state: AtomicU8,
    frames_read: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Snapshot for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub stream_name: String,
    pub state: PeerState,
    pub format: StreamFormat,
    pub resampled_frames: usize,
    pub producer_addr: String,
    pub connected_at: DateTime<Utc>,
    pub last_announce_ms: u64,
    pub ready: bool,
    pub queue_len: usize,
    pub frames_read: u64,
    pub samples_enqueued: usize,
    pub queue_resets: usize,
    pub underruns: usize,
}

pub struct PeerConnection {
    name: String,
    stream_name: String,
    segment: SegmentId,
    format: StreamFormat,
    resampled_frames: usize,
    producer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    last_announce: Mutex<Instant>,
    queue: Arc<SampleQueue>,
    shared: Arc<Shared>,
    control: Option<Arc<UdpSocket>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    close_grace: Duration,
}

/// Everything the polling thread owns
struct Worker {
    name: String,
    reader: RingReader,
    resampler: Box<dyn Resampler>,
    queue: Arc<SampleQueue>,
    shared: Arc<Shared>,
    control: Option<Arc<UdpSocket>>,
    events: Sender<RegistryEvent>,
    frames_per_buffer: usize,
    channels: usize,
    resampled_frames: usize,
    poll_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        let mut slot = vec![0f32; self.frames_per_buffer * self.channels];
        let mut channel_out = vec![0f32; self.resampled_frames];
        let mut interleaved = vec![0f32; self.resampled_frames * self.channels];

        while self.shared.running.load(Ordering::Relaxed) {
            if self.reader.try_read_samples(&mut slot).is_none() {
                self.poll_control();
                thread::sleep(self.poll_interval);
                continue;
            }

            for c in 0..self.channels {
                let input = &slot[c * self.frames_per_buffer..(c + 1) * self.frames_per_buffer];
                self.resampler.process(c, input, &mut channel_out);
                for (frame, sample) in channel_out.iter().enumerate() {
                    interleaved[frame * self.channels + c] = *sample;
                }
            }
            self.queue.push_batch(&interleaved);
            self.shared.frames_read.fetch_add(1, Ordering::Relaxed);
            self.shared.ready.store(true, Ordering::Release);
        }

        self.reader.close();
        tracing::debug!("Polling thread for {} exited", self.name);
    }

    fn poll_control(&self) {
        let Some(socket) = &self.control else {
            return;
        };
        let mut buf = [0u8; 1024];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, _)) => {
                    if let ControlMessage::Command(text) = ControlMessage::parse(&buf[..n]) {
                        let event = RegistryEvent::Command {
                            name: self.name.clone(),
                            text,
                        };
                        if self.events.try_send(event).is_err() {
                            tracing::debug!("Event channel full, dropped command for {}", self.name);
                        }
                    }
                }
                Err(e) if udp::is_idle_error(&e) => return,
                Err(e) => {
                    tracing::debug!("Control receive for {} failed: {}", self.name, e);
                    return;
                }
            }
        }
    }
}

impl PeerConnection {
    /// Attach to the announced ring and start polling it.
    ///
    /// `from` is the announcement's source; the producer's control address
    /// is its IP with the announced return port.
    pub fn connect(
        announcement: &Announcement,
        from: SocketAddr,
        consumer: &ConsumerConfig,
        events: Sender<RegistryEvent>,
        now: Instant,
    ) -> Result<Self, PeerError> {
        let name = announcement.segment.name().to_string();
        let format = announcement.format;
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            state: AtomicU8::new(PeerState::Announced as u8),
            frames_read: AtomicU64::new(0),
        });

        format.validate()?;
        let resampled_frames = resampled_len(
            format.frames_per_buffer as usize,
            format.sample_rate,
            consumer.required_sample_rate,
        );
        if resampled_frames == 0 {
            return Err(PeerError::InvalidFormat(format!(
                "{} Hz cannot be resampled to {} Hz",
                format.sample_rate, consumer.required_sample_rate
            )));
        }

        let resampler = build_resampler(
            consumer.resampler,
            format.channels as usize,
            format.frames_per_buffer as usize,
            format.sample_rate,
            consumer.required_sample_rate,
        )
        .map_err(|e| PeerError::InvalidFormat(e.to_string()))?;

        shared.set_state(PeerState::Attaching);
        let attach_failed = |source| PeerError::AttachFailed {
            name: name.clone(),
            source,
        };
        let layout = RingLayout::for_format(&format).map_err(attach_failed)?;
        let reader = RingReader::attach(announcement.segment.clone(), layout, consumer.backend)
            .map_err(attach_failed)?;

        let producer_addr = SocketAddr::new(from.ip(), announcement.return_port);
        let control = match udp::bind_ephemeral(IpAddr::V4(Ipv4Addr::UNSPECIFIED)) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                tracing::warn!("No control socket for {}: {}", name, e);
                None
            }
        };
        if let Some(socket) = &control {
            register_return_port(socket, producer_addr, &name);
        }

        let queue = Arc::new(SampleQueue::new(OverflowPolicy::new(
            consumer.target_queue_depth,
            format.ring_capacity_samples(),
            consumer.overflow_multiplier,
        )));

        let worker = Worker {
            name: name.clone(),
            reader,
            resampler,
            queue: queue.clone(),
            shared: shared.clone(),
            control: control.clone(),
            events,
            frames_per_buffer: format.frames_per_buffer as usize,
            channels: format.channels as usize,
            resampled_frames,
            poll_interval: consumer.poll_interval(),
        };

        shared.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("peer-{}", name))
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.running.store(false, Ordering::SeqCst);
                PeerError::SpawnFailed(e.to_string())
            })?;
        shared.set_state(PeerState::Active);

        tracing::info!(
            "Connected to {} ({:?}): {} frames @ {} Hz x{} -> {} frames @ {} Hz",
            name,
            announcement.stream_name,
            format.frames_per_buffer,
            format.sample_rate,
            format.channels,
            resampled_frames,
            consumer.required_sample_rate
        );

        Ok(Self {
            name,
            stream_name: announcement.stream_name.clone(),
            segment: announcement.segment.clone(),
            format,
            resampled_frames,
            producer_addr,
            connected_at: Utc::now(),
            last_announce: Mutex::new(now),
            queue,
            shared,
            control,
            thread_handle: Mutex::new(Some(handle)),
            close_grace: consumer.close_grace(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn segment(&self) -> &SegmentId {
        &self.segment
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Frames per channel pushed for every slot read
    pub fn resampled_frames(&self) -> usize {
        self.resampled_frames
    }

    pub fn producer_addr(&self) -> SocketAddr {
        self.producer_addr
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Record an announcement received at `now`
    pub fn touch_at(&self, now: Instant) {
        *self.last_announce.lock() = now;
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_announce.lock())
    }

    /// True once the age reaches `timeout`
    pub fn is_stale_at(&self, now: Instant, timeout: Duration) -> bool {
        self.age_at(now) >= timeout
    }

    pub(crate) fn mark_stale(&self) {
        self.shared.set_state(PeerState::Stale);
    }

    /// At least one slot has been queued
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Next interleaved sample. Never blocks.
    pub fn try_pop_sample(&self) -> Option<f32> {
        self.queue.try_dequeue()
    }

    pub fn pop_or_silence(&self) -> f32 {
        self.try_pop_sample().unwrap_or(0.0)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn frames_read(&self) -> u64 {
        self.shared.frames_read.load(Ordering::Relaxed)
    }

    pub fn queue(&self) -> &SampleQueue {
        &self.queue
    }

    /// Send free-form text to the producer's control socket
    pub fn send_command(&self, text: &str) -> Result<(), NetworkError> {
        let socket = self.control.as_ref().ok_or(NetworkError::NoReturnAddress)?;
        udp::send_to(socket, text.as_bytes(), self.producer_addr)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed
    }

    /// Stop the polling thread. Waits up to the close grace period for it to
    /// exit; a thread still busy after that is detached and releases the
    /// segment itself when it notices the stop flag. Idempotent.
    pub fn close(&self) {
        let Some(handle) = self.thread_handle.lock().take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.ready.store(false, Ordering::Release);

        let deadline = Instant::now() + self.close_grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::warn!(
                "Polling thread for {} did not stop within {:?}, detaching",
                self.name,
                self.close_grace
            );
        }

        self.shared.set_state(PeerState::Closed);
        tracing::info!("Closed connection {}", self.name);
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.name.clone(),
            stream_name: self.stream_name.clone(),
            state: self.state(),
            format: self.format,
            resampled_frames: self.resampled_frames,
            producer_addr: self.producer_addr.to_string(),
            connected_at: self.connected_at,
            last_announce_ms: self.age_at(Instant::now()).as_millis() as u64,
            ready: self.is_ready(),
            queue_len: self.queue.len(),
            frames_read: self.frames_read(),
            samples_enqueued: self.queue.enqueued(),
            queue_resets: self.queue.reset_count(),
            underruns: self.queue.underrun_count(),
        }
    }
}

fn register_return_port(socket: &UdpSocket, producer: SocketAddr, name: &str) {
    let port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            tracing::warn!("Control socket for {} has no address: {}", name, e);
            return;
        }
    };
    let message = ControlMessage::ReturnPort(port).encode();
    if let Err(e) = udp::send_to(socket, message.as_bytes(), producer) {
        tracing::warn!("Could not register return port with {}: {}", producer, e);
    }
}

impl SampleSource for PeerConnection {
    fn channels(&self) -> usize {
        self.format.channels as usize
    }

    fn is_ready(&self) -> bool {
        PeerConnection::is_ready(self)
    }

    fn pop_or_silence(&self) -> f32 {
        PeerConnection::pop_or_silence(self)
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}
