//! Producer side: ring writer, announcements and control socket
//!
//! The application fills [`Producer::write_buffer`] with one slot of planar
//! samples and calls [`Producer::publish`]. [`Producer::tick`] re-announces
//! the ring at the configured interval, independent of the audio rate.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::EVENT_CAPACITY;
use crate::audio::ring::{RingLayout, RingWriter};
use crate::config::{DiscoveryConfig, ProducerConfig};
use crate::error::{Error, PeerError, Result, ShmError};
use crate::network::udp;
use crate::protocol::{Announcement, ControlMessage, StreamFormat};
use crate::shm::{Segment, SegmentId};

/// Notifications from the control socket
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    /// A consumer registered its return address
    PeerRegistered(SocketAddr),
    /// Free-form text from a consumer
    Command { from: SocketAddr, text: String },
}

pub struct Producer {
    ring: RingWriter,
    format: StreamFormat,
    stream_name: String,
    buffer: Vec<f32>,
    announce_socket: UdpSocket,
    announce_target: SocketAddr,
    announce_interval: std::time::Duration,
    announcement: Bytes,
    last_announce: Option<Instant>,
    control: Arc<UdpSocket>,
    control_port: u16,
    peers: Arc<Mutex<Vec<SocketAddr>>>,
    running: Arc<AtomicBool>,
    control_thread: Option<JoinHandle<()>>,
    events_rx: Receiver<ProducerEvent>,
    published: u64,
}

/// Create a ring on the first free key in `start..end`
fn allocate_ring(config: &ProducerConfig, layout: RingLayout) -> Result<RingWriter> {
    for key in config.key_start..config.key_end {
        match RingWriter::create(SegmentId::from_key(key), layout, config.backend) {
            Ok(ring) => return Ok(ring),
            Err(ShmError::AlreadyExists(_)) => continue,
            Err(e) => {
                tracing::error!("Could not create segment for key {}: {}", key, e);
                return Err(e.into());
            }
        }
    }
    Err(ShmError::KeysExhausted {
        start: config.key_start,
        end: config.key_end,
    }
    .into())
}

/// Keep one return address per consumer host. A host that registers again
/// (reconnect on a new ephemeral port) replaces its old entry.
/// Returns false when `addr` was already the current entry.
fn register_peer(peers: &mut Vec<SocketAddr>, addr: SocketAddr) -> bool {
    match peers.iter_mut().find(|p| p.ip() == addr.ip()) {
        Some(existing) if *existing == addr => false,
        Some(existing) => {
            tracing::debug!("Return address {} replaced by {}", existing, addr);
            *existing = addr;
            true
        }
        None => {
            peers.push(addr);
            true
        }
    }
}

fn control_loop(
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    peers: Arc<Mutex<Vec<SocketAddr>>>,
    events: Sender<ProducerEvent>,
) {
    let mut buf = [0u8; 1024];
    while running.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if udp::is_idle_error(&e) => continue,
            Err(e) => {
                tracing::warn!("Control receive failed: {}", e);
                continue;
            }
        };

        let event = match ControlMessage::parse(&buf[..n]) {
            ControlMessage::ReturnPort(port) => {
                let addr = SocketAddr::new(from.ip(), port);
                if !register_peer(&mut peers.lock(), addr) {
                    continue;
                }
                tracing::info!("Consumer registered return address {}", addr);
                ProducerEvent::PeerRegistered(addr)
            }
            ControlMessage::Command(text) => {
                tracing::debug!("Command from {}: {}", from, text);
                ProducerEvent::Command { from, text }
            }
        };
        if events.try_send(event).is_err() {
            tracing::trace!("Producer event dropped, channel full");
        }
    }
}

impl Producer {
    /// Allocate the ring, bind the control port and prepare announcements
    pub fn open(config: &ProducerConfig, discovery: &DiscoveryConfig) -> Result<Self> {
        let format = config.format();
        format.validate()?;
        if config.key_start >= config.key_end {
            return Err(Error::Config(format!(
                "empty key range {}..{}",
                config.key_start, config.key_end
            )));
        }

        let layout = RingLayout::for_format(&format)?;
        let ring = allocate_ring(config, layout)?;

        let first_port = discovery.port.saturating_add(1);
        let last_port = discovery.port.saturating_add(config.control_port_span);
        let control = udp::bind_port_in_range(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            first_port,
            last_port,
            discovery.receive_timeout(),
        )?;
        let control_port = control.local_addr()?.port();
        let control = Arc::new(control);

        let announce_socket = udp::create_announce_socket(discovery.broadcast)?;
        let announcement = Announcement {
            segment: ring.segment().id().clone(),
            stream_name: config.stream_name.clone(),
            format,
            return_port: control_port,
        }
        .encode()?;

        let running = Arc::new(AtomicBool::new(true));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let (events, events_rx) = bounded(EVENT_CAPACITY);

        let thread_socket = control.clone();
        let thread_running = running.clone();
        let thread_peers = peers.clone();
        let control_thread = thread::Builder::new()
            .name("producer-control".to_string())
            .spawn(move || control_loop(thread_socket, thread_running, thread_peers, events))
            .map_err(|e| PeerError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            "Producer {:?} on {} ({} frames @ {} Hz x{}, {} slots), control port {}",
            config.stream_name,
            ring.segment().id(),
            format.frames_per_buffer,
            format.sample_rate,
            format.channels,
            format.ring_slot_count,
            control_port
        );

        Ok(Self {
            ring,
            format,
            stream_name: config.stream_name.clone(),
            buffer: vec![0.0; format.samples_per_slot()],
            announce_socket,
            announce_target: discovery.announce_target(),
            announce_interval: discovery.announce_interval(),
            announcement,
            last_announce: None,
            control,
            control_port,
            peers,
            running,
            control_thread: Some(control_thread),
            events_rx,
            published: 0,
        })
    }

    /// One slot of planar samples: channel `c` is
    /// `[c * frames_per_buffer, (c + 1) * frames_per_buffer)`
    pub fn write_buffer(&mut self) -> &mut [f32] {
        &mut self.buffer
    }

    /// One channel of the write buffer, if it exists
    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        let frames = self.format.frames_per_buffer as usize;
        self.buffer.chunks_exact_mut(frames).nth(channel)
    }

    /// Copy the write buffer into the next slot and publish it
    pub fn publish(&mut self) -> Result<u32> {
        let index = self.ring.write_samples(&self.buffer)?;
        self.published += 1;
        Ok(index)
    }

    /// Announce if the interval has elapsed. Returns true when sent.
    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> bool {
        if !self.is_open() {
            return false;
        }
        let due = match self.last_announce {
            Some(last) => now.saturating_duration_since(last) >= self.announce_interval,
            None => true,
        };
        if !due {
            return false;
        }
        self.last_announce = Some(now);
        self.announce()
    }

    /// Send the announcement now. Failures are logged and skipped.
    /// A closed producer never announces.
    pub fn announce(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        match udp::send_to(&self.announce_socket, &self.announcement, self.announce_target) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Announcement to {} failed: {}", self.announce_target, e);
                false
            }
        }
    }

    /// Send text to every registered consumer. Returns how many got it.
    pub fn send_command(&self, text: &str) -> usize {
        let peers = self.peers.lock().clone();
        peers
            .into_iter()
            .filter(|addr| match udp::send_to(&self.control, text.as_bytes(), *addr) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Command to {} failed: {}", addr, e);
                    false
                }
            })
            .count()
    }

    pub fn events(&self) -> Receiver<ProducerEvent> {
        self.events_rx.clone()
    }

    /// Consumers that registered a return address
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().clone()
    }

    pub fn segment_id(&self) -> &SegmentId {
        self.ring.segment().id()
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Slots published so far
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn is_open(&self) -> bool {
        self.ring.segment().is_opened()
    }

    /// Stop the control thread and destroy the segment. Idempotent.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.control_thread.take() {
            let _ = handle.join();
        }
        if self.ring.segment().is_opened() {
            self.ring.close();
            tracing::info!("Producer {} closed", self.ring.segment().id());
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn discovery(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            port,
            announce_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast: false,
            ..DiscoveryConfig::default()
        }
    }

    fn producer_config(key_start: i32) -> ProducerConfig {
        ProducerConfig {
            stream_name: "unit".into(),
            frames_per_buffer: 32,
            channels: 2,
            key_start,
            key_end: key_start + 3,
            control_port_span: 200,
            ..ProducerConfig::default()
        }
    }

    fn base_key() -> i32 {
        500_000 + (std::process::id() as i32 % 2_000) * 20
    }

    fn listener() -> (UdpSocket, u16) {
        let socket = udp::bind_discovery_socket(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            Duration::from_millis(500),
        )
        .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_key_probing_and_exhaustion() {
        let (_sock, port) = listener();
        let config = producer_config(base_key());

        let mut producers: Vec<Producer> = (0..3)
            .map(|_| Producer::open(&config, &discovery(port)).unwrap())
            .collect();
        let keys: Vec<i32> = producers.iter().map(|p| p.segment_id().key()).collect();
        assert_eq!(keys, vec![config.key_start, config.key_start + 1, config.key_start + 2]);

        let result = Producer::open(&config, &discovery(port));
        assert!(matches!(
            result,
            Err(Error::Shm(ShmError::KeysExhausted { .. }))
        ));

        // Closing frees the key for the next producer
        producers[0].close();
        producers[0].close();
        let again = Producer::open(&config, &discovery(port)).unwrap();
        assert_eq!(again.segment_id().key(), config.key_start);
    }

    #[test]
    fn test_tick_announces_at_interval() {
        let (sock, port) = listener();
        let mut producer = Producer::open(&producer_config(base_key() + 5), &discovery(port)).unwrap();
        assert!(producer.control_port() > port);

        let t0 = Instant::now();
        assert!(producer.tick_at(t0));
        assert!(!producer.tick_at(t0 + Duration::from_millis(50)));
        assert!(producer.tick_at(t0 + Duration::from_millis(100)));

        let mut buf = [0u8; 2048];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        let ann = Announcement::decode(&buf[..n]).unwrap();
        assert_eq!(&ann.segment, producer.segment_id());
        assert_eq!(ann.stream_name, "unit");
        assert_eq!(ann.return_port, producer.control_port());
        assert_eq!(ann.format, producer.format());
    }

    #[test]
    fn test_channel_views_and_publish() {
        let (_sock, port) = listener();
        let mut producer = Producer::open(&producer_config(base_key() + 10), &discovery(port)).unwrap();
        assert_eq!(producer.write_buffer().len(), 64);

        producer.channel_mut(1).unwrap().fill(1.0);
        assert!(producer.channel_mut(2).is_none());
        assert_eq!(producer.write_buffer()[31], 0.0);
        assert_eq!(producer.write_buffer()[32], 1.0);

        assert_eq!(producer.publish().unwrap(), 1);
        assert_eq!(producer.publish().unwrap(), 0);
        assert_eq!(producer.published(), 2);
    }

    #[test]
    fn test_control_registration_and_commands() {
        let (_sock, port) = listener();
        let producer = Producer::open(&producer_config(base_key() + 15), &discovery(port)).unwrap();
        let events = producer.events();

        let consumer = udp::bind_discovery_socket(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            Duration::from_millis(500),
        )
        .unwrap();
        let consumer_port = consumer.local_addr().unwrap().port();
        let control = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), producer.control_port());

        let register = ControlMessage::ReturnPort(consumer_port).encode();
        udp::send_to(&consumer, register.as_bytes(), control).unwrap();
        udp::send_to(&consumer, b"mute", control).unwrap();

        let timeout = Duration::from_secs(2);
        assert!(matches!(
            events.recv_timeout(timeout).unwrap(),
            ProducerEvent::PeerRegistered(addr) if addr.port() == consumer_port
        ));
        assert!(matches!(
            events.recv_timeout(timeout).unwrap(),
            ProducerEvent::Command { text, .. } if text == "mute"
        ));

        assert_eq!(producer.send_command("gain 0.5"), 1);
        let mut buf = [0u8; 64];
        let (n, _) = consumer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"gain 0.5");
    }

    #[test]
    fn test_closed_producer_stops_announcing() {
        let (sock, port) = listener();
        let mut producer = Producer::open(&producer_config(base_key() + 20), &discovery(port)).unwrap();
        producer.close();
        assert!(!producer.is_open());

        assert!(!producer.tick_at(Instant::now()));
        assert!(!producer.announce());
        sock.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 2048];
        assert!(sock.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_reconnecting_host_replaces_return_address() {
        let mut peers = Vec::new();
        let first: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let moved: SocketAddr = "127.0.0.1:41001".parse().unwrap();
        let other_host: SocketAddr = "10.0.0.2:41000".parse().unwrap();

        assert!(register_peer(&mut peers, first));
        assert!(!register_peer(&mut peers, first));
        assert!(register_peer(&mut peers, moved));
        assert!(register_peer(&mut peers, other_host));
        assert_eq!(peers, vec![moved, other_host]);
    }

    #[test]
    fn test_reregistering_host_keeps_one_address() {
        let (_sock, port) = listener();
        let producer = Producer::open(&producer_config(base_key() + 25), &discovery(port)).unwrap();
        let events = producer.events();
        let control = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), producer.control_port());

        // Held open so every registration uses a distinct port
        let mut consumers = Vec::new();
        for _ in 0..20 {
            let consumer = udp::bind_ephemeral(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
            let consumer_port = consumer.local_addr().unwrap().port();
            let register = ControlMessage::ReturnPort(consumer_port).encode();
            udp::send_to(&consumer, register.as_bytes(), control).unwrap();
            assert!(matches!(
                events.recv_timeout(Duration::from_secs(2)).unwrap(),
                ProducerEvent::PeerRegistered(addr) if addr.port() == consumer_port
            ));
            consumers.push(consumer);
        }

        assert_eq!(producer.peers().len(), 1);
        assert_eq!(producer.send_command("x"), 1);
    }
}
