//! Application configuration
//!
//! All values are plain data handed to the core explicitly. Files are TOML,
//! stored in the platform config directory unless a path is given.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::resample::ResamplerKind;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::StreamFormat;
use crate::shm::Backend;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoveryConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub ui: UiConfig,
}

/// UDP discovery settings shared by both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Well-known port consumers listen on
    pub port: u16,
    /// Address the consumer binds its listening socket to
    pub bind_address: IpAddr,
    /// Address producers send announcements to
    pub announce_address: IpAddr,
    /// Enable SO_BROADCAST on the announce socket
    pub broadcast: bool,
    pub announce_interval_ms: u64,
    pub peer_timeout_ms: u64,
    /// Read timeout of blocking receive loops
    pub receive_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announce_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast: true,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            receive_timeout_ms: 50,
        }
    }
}

impl DiscoveryConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn announce_target(&self) -> SocketAddr {
        SocketAddr::new(self.announce_address, self.port)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }
}

/// Producer-side stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Human-readable stream name carried in announcements
    pub stream_name: String,
    pub frames_per_buffer: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub ring_slot_count: u32,
    /// Segment keys probed in `key_start..key_end`
    pub key_start: i32,
    pub key_end: i32,
    /// Control ports probed in `port + 1 ..= port + span`
    pub control_port_span: u16,
    pub backend: Backend,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stream_name: "audio".to_string(),
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            ring_slot_count: DEFAULT_RING_SLOT_COUNT,
            key_start: DEFAULT_KEY_START,
            key_end: DEFAULT_KEY_END,
            control_port_span: DEFAULT_CONTROL_PORT_SPAN,
            backend: Backend::default(),
        }
    }
}

impl ProducerConfig {
    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            frames_per_buffer: self.frames_per_buffer,
            sample_rate: self.sample_rate,
            channels: self.channels,
            ring_slot_count: self.ring_slot_count,
        }
    }
}

/// Consumer-side pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Rate every peer is resampled to
    pub required_sample_rate: u32,
    /// Queue depth (samples) the audio callback is expected to keep
    pub target_queue_depth: usize,
    /// Queue is reset when its length exceeds this multiple of both the
    /// target depth and the ring capacity
    pub overflow_multiplier: usize,
    pub poll_interval_ms: u64,
    pub close_grace_ms: u64,
    pub backend: Backend,
    pub resampler: ResamplerKind,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            required_sample_rate: DEFAULT_SAMPLE_RATE,
            target_queue_depth: DEFAULT_TARGET_QUEUE_DEPTH,
            overflow_multiplier: DEFAULT_OVERFLOW_MULTIPLIER,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            backend: Backend::default(),
            resampler: ResamplerKind::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "shared-audio-bus")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()
                .ok_or_else(|| Error::Config("no config directory available".into()))?,
        };
        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the config file if present, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let exists = match path {
            Some(p) => p.exists(),
            None => Self::default_path().map(|p| p.exists()).unwrap_or(false),
        };
        if exists {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write to `path`, or to the default location
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()
                .ok_or_else(|| Error::Config("no config directory available".into()))?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        if d.port == 0 {
            return Err(Error::Config("discovery.port must be non-zero".into()));
        }
        if d.announce_interval_ms == 0 {
            return Err(Error::Config("discovery.announce_interval_ms must be non-zero".into()));
        }
        if d.announce_interval_ms >= d.peer_timeout_ms {
            return Err(Error::Config(format!(
                "discovery.announce_interval_ms ({}) must be below peer_timeout_ms ({})",
                d.announce_interval_ms, d.peer_timeout_ms
            )));
        }

        let p = &self.producer;
        p.format()
            .validate()
            .map_err(|e| Error::Config(format!("producer: {}", e)))?;
        if p.key_start < 0 || p.key_start >= p.key_end {
            return Err(Error::Config(format!(
                "producer key range {}..{} is empty",
                p.key_start, p.key_end
            )));
        }
        if p.control_port_span == 0 {
            return Err(Error::Config("producer.control_port_span must be non-zero".into()));
        }

        let c = &self.consumer;
        if c.required_sample_rate == 0 {
            return Err(Error::Config("consumer.required_sample_rate must be non-zero".into()));
        }
        if c.overflow_multiplier == 0 {
            return Err(Error::Config("consumer.overflow_multiplier must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.port, 2020);
        assert_eq!(config.discovery.peer_timeout(), Duration::from_secs(1));
        assert_eq!(config.producer.format().ring_slot_count, 2);
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = AppConfig::default();
        config.producer.stream_name = "synth".into();
        config.consumer.required_sample_rate = 48000;
        config.consumer.backend = Backend::Paged;
        config.consumer.resampler = ResamplerKind::Linear;

        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.producer.stream_name, "synth");
        assert_eq!(parsed.consumer.required_sample_rate, 48000);
        assert_eq!(parsed.consumer.backend, Backend::Paged);
        assert_eq!(parsed.consumer.resampler, ResamplerKind::Linear);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = AppConfig::from_toml("[discovery]\nport = 3030\n").unwrap();
        assert_eq!(parsed.discovery.port, 3030);
        assert_eq!(parsed.discovery.peer_timeout_ms, 1000);
        assert_eq!(parsed.producer.frames_per_buffer, 512);
        assert_eq!(parsed.consumer.resampler, ResamplerKind::Sinc);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.producer.ring_slot_count = 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.discovery.announce_interval_ms = 2000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.producer.key_end = config.producer.key_start;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!(
            "shared-audio-bus-config-{}.toml",
            std::process::id()
        ));
        let mut config = AppConfig::default();
        config.ui.http_port = 9090;
        config.save(Some(&path)).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.ui.http_port, 9090);
        let _ = std::fs::remove_file(&path);
    }
}
