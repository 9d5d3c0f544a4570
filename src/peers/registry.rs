//! Consumer-side discovery registry
//!
//! One receive thread owns the announcement loop. An unseen segment name is
//! attached on the spot; a known one only has its timestamp refreshed.
//! Entries that stop announcing are closed by the sweep, which runs on the
//! receive thread between datagrams and can also be driven by the caller.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::connection::{ConnectionStatus, PeerConnection};
use super::{DisconnectReason, RegistryEvent, EVENT_CAPACITY};
use crate::config::{ConsumerConfig, DiscoveryConfig};
use crate::constants::MAX_PACKET_SIZE;
use crate::error::{PeerError, Result};
use crate::network::udp;
use crate::protocol::Announcement;

/// Counters exposed by the status API
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub datagrams: u64,
    pub malformed: u64,
    pub attach_failures: u64,
    pub evictions: u64,
}

struct Inner {
    discovery: DiscoveryConfig,
    consumer: ConsumerConfig,
    table: Mutex<HashMap<String, Arc<PeerConnection>>>,
    running: AtomicBool,
    events: Sender<RegistryEvent>,
    datagrams: AtomicU64,
    malformed: AtomicU64,
    attach_failures: AtomicU64,
    evictions: AtomicU64,
}

impl Inner {
    fn emit(&self, event: RegistryEvent) {
        if self.events.try_send(event).is_err() {
            tracing::trace!("Registry event dropped, channel full");
        }
    }

    fn handle_datagram_at(&self, data: &[u8], from: SocketAddr, now: Instant) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);

        let announcement = match Announcement::decode(data) {
            Ok(a) => a,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropped malformed announcement from {}: {}", from, e);
                return;
            }
        };

        let name = announcement.segment.name().to_string();
        let producer_addr = SocketAddr::new(from.ip(), announcement.return_port);

        let replaced = {
            let mut table = self.table.lock();
            match table.get(&name) {
                Some(conn)
                    if conn.producer_addr() == producer_addr
                        && conn.format() == announcement.format =>
                {
                    conn.touch_at(now);
                    return;
                }
                Some(_) => table.remove(&name),
                None => None,
            }
        };

        if let Some(old) = replaced {
            tracing::info!(
                "{} re-announced from {} with a new identity, reconnecting",
                name,
                producer_addr
            );
            old.close();
            self.emit(RegistryEvent::Disconnected {
                name: name.clone(),
                reason: DisconnectReason::Replaced,
            });
        }

        match PeerConnection::connect(
            &announcement,
            from,
            &self.consumer,
            self.events.clone(),
            now,
        ) {
            Ok(conn) => {
                self.table.lock().insert(name.clone(), Arc::new(conn));
                self.emit(RegistryEvent::Connected {
                    name,
                    stream_name: announcement.stream_name,
                    format: announcement.format,
                });
            }
            Err(e) => {
                self.attach_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Could not connect to {}: {}", name, e);
            }
        }
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let timeout = self.discovery.peer_timeout();
        let stale: Vec<Arc<PeerConnection>> = {
            let mut table = self.table.lock();
            let names: Vec<String> = table
                .iter()
                .filter(|(_, conn)| conn.is_stale_at(now, timeout))
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| table.remove(name)).collect()
        };

        for conn in &stale {
            conn.mark_stale();
            tracing::info!(
                "{} timed out after {:?} without an announcement",
                conn.name(),
                conn.age_at(now)
            );
            conn.close();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.emit(RegistryEvent::Disconnected {
                name: conn.name().to_string(),
                reason: DisconnectReason::Timeout,
            });
        }
        stale.len()
    }

    fn close_all(&self) {
        let drained: Vec<Arc<PeerConnection>> =
            self.table.lock().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            conn.close();
            self.emit(RegistryEvent::Disconnected {
                name: conn.name().to_string(),
                reason: DisconnectReason::Shutdown,
            });
        }
    }
}

fn receive_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let sweep_interval = inner.discovery.announce_interval();
    let mut last_sweep = Instant::now();

    while inner.running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => inner.handle_datagram_at(&buf[..n], from, Instant::now()),
            Err(e) if udp::is_idle_error(&e) => {}
            Err(e) => {
                tracing::warn!("Discovery receive failed: {}", e);
            }
        }

        if last_sweep.elapsed() >= sweep_interval {
            inner.sweep_at(Instant::now());
            last_sweep = Instant::now();
        }
    }
    tracing::debug!("Discovery receive loop exited");
}

/// Table of live producer connections
pub struct DiscoveryRegistry {
    inner: Arc<Inner>,
    events_rx: Receiver<RegistryEvent>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryRegistry {
    /// Bind the discovery port and start the receive thread
    pub fn start(discovery: DiscoveryConfig, consumer: ConsumerConfig) -> Result<Self> {
        let socket = udp::bind_discovery_socket(discovery.listen_addr(), discovery.receive_timeout())?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (events, events_rx) = bounded(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            discovery,
            consumer,
            table: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            events,
            datagrams: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            attach_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        let thread_inner = inner.clone();
        let thread_socket = socket.clone();
        let handle = thread::Builder::new()
            .name("discovery-receive".to_string())
            .spawn(move || receive_loop(thread_inner, thread_socket))
            .map_err(|e| PeerError::SpawnFailed(e.to_string()))?;

        tracing::info!("Discovery registry listening on {}", local_addr);

        Ok(Self {
            inner,
            events_rx,
            socket: Mutex::new(Some(socket)),
            local_addr,
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Process one datagram as if it arrived from `from` at `now`
    pub fn handle_datagram_at(&self, data: &[u8], from: SocketAddr, now: Instant) {
        self.inner.handle_datagram_at(data, from, now);
    }

    /// Close entries older than the peer timeout. Returns how many.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        self.inner.sweep_at(now)
    }

    /// Snapshot of the table
    pub fn connections(&self) -> HashMap<String, Arc<PeerConnection>> {
        self.inner.table.lock().clone()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<PeerConnection>> {
        self.inner.table.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every connection, sorted by name
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .connections()
            .values()
            .map(|conn| conn.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            datagrams: self.inner.datagrams.load(Ordering::Relaxed),
            malformed: self.inner.malformed.load(Ordering::Relaxed),
            attach_failures: self.inner.attach_failures.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Connection and command notifications
    pub fn events(&self) -> Receiver<RegistryEvent> {
        self.events_rx.clone()
    }

    /// Send text to one producer's control socket
    pub fn send_command(&self, name: &str, text: &str) -> Result<()> {
        let conn = self
            .connection(name)
            .ok_or_else(|| PeerError::NotFound(name.to_string()))?;
        conn.send_command(text)?;
        Ok(())
    }

    /// Stop receiving, close every connection, then release the socket.
    /// Idempotent.
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.close_all();
        self.socket.lock().take();
        tracing::info!("Discovery registry on {} closed", self.local_addr);
    }
}

impl Drop for DiscoveryRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audio::ring::{RingLayout, RingWriter};
    use crate::protocol::StreamFormat;
    use crate::shm::test_support::unique_id;
    use crate::shm::{Backend, SegmentId};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn discovery() -> DiscoveryConfig {
        DiscoveryConfig {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..DiscoveryConfig::default()
        }
    }

    fn format() -> StreamFormat {
        StreamFormat {
            frames_per_buffer: 128,
            sample_rate: 44100,
            channels: 1,
            ring_slot_count: 2,
        }
    }

    fn producer_ring(format: StreamFormat) -> (SegmentId, RingWriter) {
        let id = unique_id();
        let layout = RingLayout::for_format(&format).unwrap();
        let writer = RingWriter::create(id.clone(), layout, Backend::Mapped).unwrap();
        (id, writer)
    }

    fn datagram(segment: &SegmentId, format: StreamFormat, return_port: u16) -> Vec<u8> {
        Announcement {
            segment: segment.clone(),
            stream_name: "tone".into(),
            format,
            return_port,
        }
        .encode()
        .unwrap()
        .to_vec()
    }

    fn from() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_timeout_evicts_and_refresh_keeps() {
        let registry = DiscoveryRegistry::start(discovery(), ConsumerConfig::default()).unwrap();
        let (id, _writer) = producer_ring(format());
        let packet = datagram(&id, format(), 9);

        let t0 = Instant::now();
        registry.handle_datagram_at(&packet, from(), t0);
        assert!(registry.connection(id.name()).is_some());

        // Re-announced every 0.9 s: survives sweeps
        let step = Duration::from_millis(900);
        for k in 1..=3u32 {
            let now = t0 + step * k;
            assert_eq!(registry.sweep_at(now), 0);
            registry.handle_datagram_at(&packet, from(), now);
        }
        assert_eq!(registry.len(), 1);

        // Silent for exactly the timeout: gone
        let last = t0 + step * 3;
        assert_eq!(registry.sweep_at(last + Duration::from_millis(1000)), 1);
        assert!(registry.is_empty());

        let events: Vec<RegistryEvent> = registry.events().try_iter().collect();
        assert!(matches!(events.first(), Some(RegistryEvent::Connected { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            RegistryEvent::Disconnected {
                reason: DisconnectReason::Timeout,
                ..
            }
        )));
        registry.close();
    }

    #[test]
    fn test_reannounce_keeps_same_connection() {
        let registry = DiscoveryRegistry::start(discovery(), ConsumerConfig::default()).unwrap();
        let (id, _writer) = producer_ring(format());
        let packet = datagram(&id, format(), 9);

        registry.handle_datagram_at(&packet, from(), Instant::now());
        let first = registry.connection(id.name()).unwrap();
        registry.handle_datagram_at(&packet, from(), Instant::now());
        let second = registry.connection(id.name()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_new_return_port_replaces_connection() {
        let registry = DiscoveryRegistry::start(discovery(), ConsumerConfig::default()).unwrap();
        let (id, _writer) = producer_ring(format());

        registry.handle_datagram_at(&datagram(&id, format(), 9), from(), Instant::now());
        let first = registry.connection(id.name()).unwrap();
        registry.handle_datagram_at(&datagram(&id, format(), 10), from(), Instant::now());
        let second = registry.connection(id.name()).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(second.producer_addr().port(), 10);
    }

    #[test]
    fn test_malformed_and_unattachable_leave_table_alone() {
        let registry = DiscoveryRegistry::start(discovery(), ConsumerConfig::default()).unwrap();
        registry.handle_datagram_at(b"garbage", from(), Instant::now());
        registry.handle_datagram_at(&datagram(&unique_id(), format(), 9), from(), Instant::now());

        assert!(registry.is_empty());
        let stats = registry.stats();
        assert_eq!(stats.datagrams, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.attach_failures, 1);
    }

    #[test]
    fn test_receives_over_udp_and_close_drains() {
        let registry = DiscoveryRegistry::start(discovery(), ConsumerConfig::default()).unwrap();
        let (id, _writer) = producer_ring(format());

        let sender = udp::create_announce_socket(false).unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), registry.local_addr().port());
        udp::send_to(&sender, &datagram(&id, format(), 9), target).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let conn = registry.connection(id.name()).unwrap();

        registry.close();
        registry.close();
        assert!(registry.is_empty());
        assert!(conn.is_closed());
        assert!(!registry.is_running());
    }

    #[test]
    fn test_receive_thread_sweeps_silent_producer() {
        let config = DiscoveryConfig {
            announce_interval_ms: 20,
            peer_timeout_ms: 150,
            receive_timeout_ms: 10,
            ..discovery()
        };
        let registry = DiscoveryRegistry::start(config, ConsumerConfig::default()).unwrap();
        let (id, _writer) = producer_ring(format());
        registry.handle_datagram_at(&datagram(&id, format(), 9), from(), Instant::now());
        let conn = registry.connection(id.name()).unwrap();

        // Disconnected is emitted after the connection is closed and counted
        let events = registry.events();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut timed_out = false;
        while !timed_out && Instant::now() < deadline {
            if let Ok(event) = events.recv_timeout(Duration::from_millis(50)) {
                timed_out = matches!(
                    event,
                    RegistryEvent::Disconnected {
                        reason: DisconnectReason::Timeout,
                        ..
                    }
                );
            }
        }
        assert!(timed_out);
        assert!(registry.is_empty());
        assert!(conn.is_closed());
        assert_eq!(registry.stats().evictions, 1);
        registry.close();
    }
}
