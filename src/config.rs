//! `trx.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level transceiver configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrxConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// URI-style discovery string, e.g. "type=b200". The `run`
    /// positional argument overrides this.
    #[serde(default)]
    pub args: String,
    /// Reference clock source: "internal", "external" or "gpsdo".
    #[serde(default = "DeviceConfig::default_reference")]
    pub reference: String,
    /// Downlink samples per symbol: 4 uses the precision modulator (more
    /// computation, less distortion), 1 the minimized one. The uplink is
    /// always downsampled to 1 sps.
    #[serde(default = "DeviceConfig::default_sps")]
    pub sps: u32,
}

impl DeviceConfig {
    fn default_reference() -> String {
        "internal".into()
    }
    fn default_sps() -> u32 {
        4
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            args: String::new(),
            reference: Self::default_reference(),
            sps: Self::default_sps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    /// Downlink center frequency, Hz.
    #[serde(default = "RadioConfig::default_tx_freq")]
    pub tx_freq_hz: f64,
    /// Uplink center frequency, Hz.
    #[serde(default = "RadioConfig::default_rx_freq")]
    pub rx_freq_hz: f64,
    /// Receive gain, dB. Omit for mid-range.
    pub rx_gain_db: Option<f64>,
    /// Downlink attenuation relative to full power, dB.
    #[serde(default)]
    pub power_attenuation_db: f64,
}

impl RadioConfig {
    // ARFCN 1, GSM 900.
    fn default_tx_freq() -> f64 {
        935.2e6
    }
    fn default_rx_freq() -> f64 {
        890.2e6
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            tx_freq_hz: Self::default_tx_freq(),
            rx_freq_hz: Self::default_rx_freq(),
            rx_gain_db: None,
            power_attenuation_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Append a JSONL metrics snapshot to this path while running. Omit
    /// to disable the journal.
    pub snapshot_path: Option<String>,
    /// Seconds between journal snapshots.
    #[serde(default = "LogConfig::default_snapshot_secs")]
    pub snapshot_secs: u64,
}

impl LogConfig {
    fn default_snapshot_secs() -> u64 {
        5
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_secs: Self::default_snapshot_secs(),
        }
    }
}

impl TrxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A config matching the standard loopback setup.
    pub fn default_example() -> Self {
        Self {
            device: DeviceConfig {
                args: "type=b200".into(),
                ..DeviceConfig::default()
            },
            radio: RadioConfig::default(),
            log: LogConfig {
                snapshot_path: Some("/var/log/gsm-trx.jsonl".into()),
                snapshot_secs: 5,
            },
        }
    }
}
