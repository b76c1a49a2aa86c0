//! Runtime configuration, stored as TOML.
//!
//! ```toml
//! [board]
//! address = "DC:4E:6D:9F:E3:BA"
//! dac1 = 0
//! dac2 = 0
//!
//! [channels]
//! ch1 = true
//! ch2 = true
//!
//! [decoder]
//! layout = "capacitance-imu"
//! magnetometer_scale = 0.0625
//! channel_tag_base = 0
//!
//! [session]
//! poll_interval_ms = 1000
//! display_queue_capacity = 1500
//!
//! [ble]
//! scan_timeout_secs = 10
//! connect_timeout_secs = 10
//!
//! [export]
//! # directory = "/tmp/cbp"
//! ```
//!
//! Every key is optional; missing keys take the values above.  The value is
//! built once at startup and handed to the constructors that need it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::parse::{Decoder, PacketLayout};
use crate::protocol::{DAC_MAX, DEFAULT_CHANNEL_TAG_BASE, DEFAULT_MAGNETOMETER_SCALE};
use crate::sink::DEFAULT_DISPLAY_CAPACITY;
use crate::types::ChannelMap;

/// Board the CLI connects to when none is given.
pub const DEFAULT_ADDRESS: &str = "DC:4E:6D:9F:E3:BA";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub board: BoardConfig,
    pub channels: ChannelConfig,
    pub decoder: DecoderConfig,
    pub session: SessionConfig,
    pub ble: BleConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// MAC address (Linux/Windows) or CoreBluetooth identifier (macOS).
    pub address: String,
    pub dac1: u8,
    pub dac2: u8,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            dac1: 0,
            dac2: 0,
        }
    }
}

impl BoardConfig {
    pub fn dac(&self) -> ChannelMap<u8> {
        ChannelMap::new([self.dac1, self.dac2])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub ch1: bool,
    pub ch2: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ch1: true,
            ch2: true,
        }
    }
}

impl ChannelConfig {
    pub fn enabled(&self) -> ChannelMap<bool> {
        ChannelMap::new([self.ch1, self.ch2])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub layout: PacketLayout,
    pub magnetometer_scale: f64,
    /// Combined-packet tag that names CH1; CH2 is the next value.
    pub channel_tag_base: u8,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            layout: PacketLayout::default(),
            magnetometer_scale: DEFAULT_MAGNETOMETER_SCALE,
            channel_tag_base: DEFAULT_CHANNEL_TAG_BASE,
        }
    }
}

impl DecoderConfig {
    pub fn decoder(&self) -> Decoder {
        Decoder {
            layout: self.layout,
            magnetometer_scale: self.magnetometer_scale,
            channel_tag_base: self.channel_tag_base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long the session waits for a control message before checking the link.
    pub poll_interval_ms: u64,
    pub display_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            display_queue_capacity: DEFAULT_DISPLAY_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Record every session under this directory when set.
    pub directory: Option<PathBuf>,
}

impl Config {
    /// `<config dir>/cbp/config.toml`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cbp")
            .join("config.toml")
    }

    /// Read and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(write_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("board.dac1", self.board.dac1), ("board.dac2", self.board.dac2)] {
            if value > DAC_MAX {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} exceeds {DAC_MAX}"),
                });
            }
        }
        if !(self.decoder.magnetometer_scale.is_finite() && self.decoder.magnetometer_scale > 0.0)
        {
            return Err(ConfigError::Invalid {
                key: "decoder.magnetometer_scale",
                reason: format!("{} is not a positive number", self.decoder.magnetometer_scale),
            });
        }
        if self.decoder.channel_tag_base == u8::MAX {
            return Err(ConfigError::Invalid {
                key: "decoder.channel_tag_base",
                reason: "leaves no tag for CH2".to_string(),
            });
        }
        if self.decoder.layout == PacketLayout::Combined && self.channels.ch1 && self.channels.ch2 {
            return Err(ConfigError::Invalid {
                key: "channels",
                reason: "the combined layout carries both channels on one characteristic; \
                         enable only one"
                    .to_string(),
            });
        }
        if self.session.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "session.poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
