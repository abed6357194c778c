//! Configuration for contexts, rings, multiclient servers and bootstrap.
//!
//! Every section has defaults, so a config file only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TransportError};
use crate::fabric::Mtu;

/// Device and queue pair parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Device to open; the first device found when `None`.
    pub device_name: Option<String>,
    /// Physical port.
    pub port: u8,
    /// GID table index. Set on RoCE, leave unset on InfiniBand.
    pub gid_index: Option<u8>,
    /// Expected maximum outstanding requests; sizes the shared receive queue.
    pub max_outstanding: u32,
    /// Entries in each shared completion queue.
    pub cq_entries: u32,
    /// Send queue depth of each queue pair.
    pub max_send_wr: u32,
    /// Receive queue depth of queue pairs created without the shared receive queue.
    pub max_recv_wr: u32,
    /// Requested inline threshold in bytes.
    pub max_inline: u32,
    /// Path MTU; clamped to the port's active MTU.
    pub mtu: Mtu,
    /// Transport retry count (0-7).
    pub retry_count: u8,
    /// RNR retry count (0-7, 7 = infinite).
    pub rnr_retry: u8,
    /// Minimum RNR NAK timer code (0-31).
    pub min_rnr_timer: u8,
    /// Ack timeout exponent, 0 = wait forever.
    pub ack_timeout: u8,
    /// Outstanding RDMA reads and atomics in each direction.
    pub max_rd_atomic: u8,
    /// Busy-wait backoff used by blocking polls.
    pub backoff: BackoffConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            port: 1,
            gid_index: None,
            max_outstanding: 16384,
            cq_entries: 32768,
            max_send_wr: 8192,
            max_recv_wr: 1024,
            max_inline: 512,
            mtu: Mtu::Mtu4096,
            retry_count: 7,
            rnr_retry: 7,
            min_rnr_timer: 12,
            ack_timeout: 0,
            max_rd_atomic: 16,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Busy-wait ladder: spin, then yield, then sleep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Polls spent spinning with a CPU pause.
    pub spin_limit: u32,
    /// Poll count after which the thread starts sleeping; polls between
    /// `spin_limit` and here yield.
    pub yield_limit: u32,
    /// Sleep between polls once past `yield_limit`, in microseconds.
    pub sleep_us: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: 1024,
            yield_limit: 4096,
            sleep_us: 20,
        }
    }
}

/// RDMA and shared-memory ring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Ring capacity in bytes; a power of two.
    pub capacity: usize,
    /// Every Nth write is signaled.
    pub signal_interval: u32,
    /// Use write-with-immediate carrying the destination offset.
    pub immediate: bool,
    /// Backoff while waiting for credit or data.
    pub backoff: BackoffConfig,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
            signal_interval: 4096,
            immediate: false,
            backoff: BackoffConfig::default(),
        }
    }
}

/// How a multiclient server learns that a request arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplexMode {
    /// Scan a byte-per-client doorbell array.
    Doorbell,
    /// One posted receive per client, completions on the shared receive queue.
    ReceiveQueue,
}

/// Multiclient server parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticlientConfig {
    /// Upper bound on accepted clients.
    pub max_clients: usize,
    /// Bytes per request and response slot, including the 8-byte length prefix.
    pub slot_size: usize,
    /// Request notification mode.
    pub mode: MultiplexMode,
    /// Every Nth answer on a connection is signaled.
    pub signal_interval: u32,
}

impl Default for MulticlientConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            slot_size: 4096,
            mode: MultiplexMode::Doorbell,
            signal_interval: 4096,
        }
    }
}

/// Out-of-band channel parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Disable Nagle on bootstrap sockets.
    pub nodelay: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// All sections together, as loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Device, queue and connect parameters.
    pub network: NetworkConfig,
    /// Ring buffer transports.
    pub ring: RingConfig,
    /// Multiclient server and clients.
    pub multiclient: MulticlientConfig,
    /// Out-of-band TCP channel.
    pub bootstrap: BootstrapConfig,
}

impl TransportConfig {
    /// Loads a TOML or JSON file, chosen by extension, and validates it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(TransportError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section and their cross-checks.
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.ring.validate()?;
        self.multiclient.validate()?;
        if self.network.max_inline as usize > self.multiclient.slot_size {
            return Err(TransportError::Config(format!(
                "inline threshold {} exceeds slot size {}",
                self.network.max_inline, self.multiclient.slot_size
            )));
        }
        Ok(())
    }
}

impl NetworkConfig {
    /// Rejects zero depths and out-of-range retry and timer codes.
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding == 0 || self.cq_entries == 0 || self.max_send_wr == 0 {
            return Err(TransportError::Config(
                "queue depths must be non-zero".to_string(),
            ));
        }
        if self.retry_count > 7 || self.rnr_retry > 7 {
            return Err(TransportError::Config(
                "retry counts are 3-bit values (0-7)".to_string(),
            ));
        }
        if self.min_rnr_timer > 31 || self.ack_timeout > 31 {
            return Err(TransportError::Config(
                "RNR timer and ack timeout are 5-bit values (0-31)".to_string(),
            ));
        }
        Ok(())
    }
}

impl RingConfig {
    /// Rejects capacities that are not a power of two and a zero signal interval.
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_power_of_two() || self.capacity < 64 {
            return Err(TransportError::Config(format!(
                "ring capacity {} is not a power of two of at least 64 bytes",
                self.capacity
            )));
        }
        if self.signal_interval == 0 {
            return Err(TransportError::Config(
                "ring signal interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl MulticlientConfig {
    /// Rejects zero clients and unaligned slot sizes.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(TransportError::Config(
                "max_clients must be non-zero".to_string(),
            ));
        }
        if self.slot_size < 16 || self.slot_size % 8 != 0 {
            return Err(TransportError::Config(format!(
                "slot size {} must be a multiple of 8 and at least 16",
                self.slot_size
            )));
        }
        if self.signal_interval == 0 {
            return Err(TransportError::Config(
                "multiclient signal interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = TransportConfig::default();
        assert_eq!(config.network.max_outstanding, 16384);
        assert_eq!(config.network.max_inline, 512);
        assert_eq!(config.network.retry_count, 7);
        assert_eq!(config.network.rnr_retry, 7);
        assert_eq!(config.network.min_rnr_timer, 12);
        assert_eq!(config.network.ack_timeout, 0);
        assert_eq!(config.ring.signal_interval, 4096);
        assert_eq!(config.multiclient.mode, MultiplexMode::Doorbell);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[network]
max_inline = 256
mtu = "2048"

[ring]
capacity = 4096
immediate = true

[multiclient]
mode = "receive_queue"
max_clients = 8
            "#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.max_inline, 256);
        assert_eq!(config.network.mtu, Mtu::Mtu2048);
        assert_eq!(config.network.max_outstanding, 16384);
        assert_eq!(config.ring.capacity, 4096);
        assert!(config.ring.immediate);
        assert_eq!(config.multiclient.mode, MultiplexMode::ReceiveQueue);
        assert_eq!(config.multiclient.max_clients, 8);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "ring": {{ "capacity": 65536, "signal_interval": 64 }},
                 "bootstrap": {{ "connect_timeout_ms": 250 }} }}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ring.capacity, 65536);
        assert_eq!(config.ring.signal_interval, 64);
        assert_eq!(config.bootstrap.connect_timeout_ms, 250);
        assert!(config.bootstrap.nodelay);
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = TransportConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        let config = RingConfig {
            capacity: 1000,
            ..RingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = MulticlientConfig {
            signal_interval: 0,
            ..MulticlientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inline_above_slot_size() {
        let mut config = TransportConfig::default();
        config.multiclient.slot_size = 256;
        config.network.max_inline = 512;
        assert!(matches!(
            config.validate(),
            Err(TransportError::Config(msg)) if msg.contains("inline")
        ));
    }

    #[test]
    fn test_rejects_out_of_range_retry() {
        let config = NetworkConfig {
            rnr_retry: 8,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
