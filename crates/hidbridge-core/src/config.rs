//! Bridge configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RetryPolicy;
use crate::queue::OverflowPolicy;

/// How bulk-in endpoints are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    /// One worker thread per bulk-in endpoint.
    #[default]
    PerEndpoint,
    /// A single worker visiting every bulk-in endpoint in turn.
    Sweep,
}

impl ReaderMode {
    fn default_poll_interval(self) -> Duration {
        match self {
            ReaderMode::PerEndpoint => Duration::from_millis(100),
            ReaderMode::Sweep => Duration::from_millis(10),
        }
    }
}

/// Configuration for a bridge.
///
/// Missing TOML keys fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface whose bulk endpoints are bridged.
    pub interface_number: u8,
    /// Upper bound of a single bulk IN transfer.
    pub read_timeout_ms: u64,
    /// Sleep between polling iterations. Unset means the reader mode default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    pub reader_mode: ReaderMode,
    pub no_device_backoff_ms: u64,
    pub connect_backoff_ms: u64,
    pub write_timeout_ms: u64,
    /// How long a claim waits for the current holder of the interface.
    pub claim_timeout_ms: u64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0483,
            product_id: 0x5740,
            interface_number: 0,
            read_timeout_ms: 50,
            poll_interval_ms: None,
            reader_mode: ReaderMode::PerEndpoint,
            no_device_backoff_ms: 10_000,
            connect_backoff_ms: 2_000,
            write_timeout_ms: 1_000,
            claim_timeout_ms: 500,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Values given on the command line, applied over a loaded config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub interface_number: Option<u8>,
    pub reader_mode: Option<ReaderMode>,
    pub poll_interval_ms: Option<u64>,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: BridgeConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay every override that is set.
    pub fn merge(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(vid) = overrides.vendor_id {
            self.vendor_id = vid;
        }
        if let Some(pid) = overrides.product_id {
            self.product_id = pid;
        }
        if let Some(interface) = overrides.interface_number {
            self.interface_number = interface;
        }
        if let Some(mode) = overrides.reader_mode {
            self.reader_mode = mode;
        }
        if overrides.poll_interval_ms.is_some() {
            self.poll_interval_ms = overrides.poll_interval_ms;
        }
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.reader_mode.default_poll_interval())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            no_device_backoff: Duration::from_millis(self.no_device_backoff_ms),
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
        }
    }
}
