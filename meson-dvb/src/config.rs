//! Configuration file (`meson-dvb.toml`).
//!
//! Every section and field is optional; missing values take the hardware
//! defaults. Example:
//!
//! ```toml
//! [device]
//! inputs = [{ mode = "parallel" }, { mode = "serial", s2p_id = 0 }]
//!
//! [demux.timeout]
//! timeout_ms = 800
//!
//! [demux.ignore]
//! mode = "suppress"
//! window_ms = 1500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use meson_dvb_types::{
    TsInputMode, DTO_CHDIS_VAS, DTO_TIMEOUT_DEF_MS, FILTER_COUNT, SEC_BUF_COUNT, SF_BUFFER_SIZE,
    SS_BUFSIZE_DEF, S2P_COUNT, TS_IN_COUNT, TS_PACKET_SIZE,
};
use serde::Deserialize;
use thiserror::Error;

use crate::buffer::MAX_POOL_SLOTS;
use crate::table::{IgnoreMode, IgnorePolicy};

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub device: DeviceConfig,
    pub demux: DemuxConfig,
    pub watchdog: WatchdogConfig,
    pub asyncfifo: AsyncFifoConfig,
    pub swfilter: SwFilterConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.inputs.len() > TS_IN_COUNT {
            return Err(ConfigError::Invalid(format!(
                "{} inputs configured, hardware has {}",
                self.device.inputs.len(),
                TS_IN_COUNT
            )));
        }
        for (i, input) in self.device.inputs.iter().enumerate() {
            if input.mode == TsInputMode::Serial && input.s2p_id as usize >= S2P_COUNT {
                return Err(ConfigError::Invalid(format!(
                    "input {} uses s2p {} (only {} converters)",
                    i, input.s2p_id, S2P_COUNT
                )));
            }
        }
        if self.asyncfifo.flush_size == 0 || self.asyncfifo.flush_size > self.asyncfifo.buf_len / 2
        {
            return Err(ConfigError::Invalid(
                "asyncfifo.flush_size must be in 1..=buf_len/2".into(),
            ));
        }
        let demux = &self.demux;
        let small_section_slots = if demux.small_section.enable && demux.small_section.max_len > 0 {
            demux.small_section.bufsize / demux.small_section.max_len
        } else {
            0
        };
        for (name, count) in [
            ("demux.pes_buf_count", demux.pes_buf_count),
            ("demux.sub_buf_count", demux.sub_buf_count),
            ("demux.small_section slots", small_section_slots),
        ] {
            if count > MAX_POOL_SLOTS {
                return Err(ConfigError::Invalid(format!(
                    "{} is {}, at most {} buffers per pool",
                    name, count, MAX_POOL_SLOTS
                )));
            }
        }
        if self.watchdog.period_ms == 0 {
            return Err(ConfigError::Invalid("watchdog.period_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub retention_days: u64,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            retention_days: 7,
            level: None,
        }
    }
}

/// One physical TS input line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TsInputConfig {
    pub mode: TsInputMode,
    /// Pin-control state name.
    pub pinctrl: Option<String>,
    pub control: bool,
    /// Serial-to-parallel converter used in serial mode.
    pub s2p_id: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub inputs: Vec<TsInputConfig>,
    /// Clock inversion per S2P converter.
    pub s2p_invert: Vec<bool>,
    pub ts_out_invert: bool,
    /// Source selected for every engine at probe (DVB numbering name).
    pub default_source: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            inputs: vec![TsInputConfig {
                mode: TsInputMode::Parallel,
                ..Default::default()
            }],
            s2p_invert: vec![false; S2P_COUNT],
            ts_out_invert: false,
            default_source: "front0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmallSectionConfig {
    pub enable: bool,
    pub bufsize: usize,
    /// Largest section taking the small-section path.
    pub max_len: usize,
}

impl Default for SmallSectionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bufsize: SS_BUFSIZE_DEF,
            max_len: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub enable: bool,
    pub timeout_ms: u64,
    /// Subtype bits (`1 << PesType`) under inactivity monitoring.
    pub ch_disable: u32,
    /// Consecutive suspect ticks before a reset.
    pub trigger_threshold: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enable: true,
            timeout_ms: DTO_TIMEOUT_DEF_MS,
            ch_disable: DTO_CHDIS_VAS,
            trigger_threshold: 2,
        }
    }
}

impl TimeoutConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    pub mode: IgnoreMode,
    pub window_ms: u64,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        let policy = IgnorePolicy::default();
        Self {
            mode: policy.mode,
            window_ms: policy.window.as_millis() as u64,
        }
    }
}

impl IgnoreConfig {
    pub fn policy(&self) -> IgnorePolicy {
        IgnorePolicy {
            mode: self.mode,
            window: Duration::from_millis(self.window_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrcConfig {
    /// Check CRC32 of sections with the syntax indicator.
    pub check: bool,
    /// CRC failures within `window_ms` that force a reset; 0 disables.
    pub storm_threshold: u32,
    pub window_ms: u64,
}

impl Default for CrcConfig {
    fn default() -> Self {
        Self {
            check: true,
            storm_threshold: 64,
            window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    pub section_buf_count: usize,
    pub pes_buf_count: usize,
    pub pes_buf_size: usize,
    pub sub_buf_count: usize,
    pub sub_buf_size: usize,
    /// Use the hardware filter table; when false every filter is software.
    pub hw_filters: bool,
    /// Fall back to software filters when the hardware table is full.
    pub sw_fallback: bool,
    pub sw_filter_count: usize,
    pub small_section: SmallSectionConfig,
    pub timeout: TimeoutConfig,
    pub ignore: IgnoreConfig,
    pub crc: CrcConfig,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            section_buf_count: SEC_BUF_COUNT,
            pes_buf_count: 16,
            pes_buf_size: 64 * 1024,
            sub_buf_count: 4,
            sub_buf_size: 64 * 1024,
            hw_filters: true,
            sw_fallback: true,
            sw_filter_count: FILTER_COUNT,
            small_section: SmallSectionConfig::default(),
            timeout: TimeoutConfig::default(),
            ignore: IgnoreConfig::default(),
            crc: CrcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub period_ms: u64,
    /// Ticks a buffer may stay busy before it is reclaimed.
    pub buffer_leak_ticks: u32,
    /// Engines excluded from the watchdog.
    pub disabled: Vec<u8>,
    pub error_check_window_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period_ms: 250,
            buffer_leak_ticks: 8,
            disabled: Vec::new(),
            error_check_window_ms: 1000,
        }
    }
}

impl WatchdogConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn error_check_window(&self) -> Duration {
        Duration::from_millis(self.error_check_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsyncFifoConfig {
    /// Total buffer length, split into two halves.
    pub buf_len: usize,
    /// Fill level of a half that raises the flush interrupt.
    pub flush_size: usize,
}

impl Default for AsyncFifoConfig {
    fn default() -> Self {
        Self {
            buf_len: 2 * 512 * TS_PACKET_SIZE,
            flush_size: 128 * TS_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwFilterConfig {
    pub enable: bool,
    pub buffer_size: usize,
    /// Async FIFO feeding the software filter.
    pub afifo: u8,
}

impl Default for SwFilterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            buffer_size: SF_BUFFER_SIZE,
            afifo: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.demux.timeout.timeout_ms, DTO_TIMEOUT_DEF_MS);
        assert_eq!(config.demux.timeout.ch_disable, DTO_CHDIS_VAS);
        assert_eq!(config.demux.ignore.policy(), IgnorePolicy::default());
        assert_eq!(config.device.inputs[0].mode, TsInputMode::Parallel);
        assert_eq!(config.watchdog.period(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [device]
            inputs = [{ mode = "parallel" }, { mode = "serial", s2p_id = 1 }]

            [demux.small_section]
            enable = true

            [demux.ignore]
            mode = "suppress"
            window_ms = 1500

            [watchdog]
            disabled = [2]
            "#,
        )
        .unwrap();
        assert_eq!(config.device.inputs[1].mode, TsInputMode::Serial);
        assert_eq!(config.device.inputs[1].s2p_id, 1);
        assert!(config.demux.small_section.enable);
        assert_eq!(config.demux.small_section.max_len, 256);
        assert_eq!(config.demux.ignore.mode, IgnoreMode::Suppress);
        assert_eq!(config.demux.ignore.policy().window, Duration::from_millis(1500));
        assert_eq!(config.watchdog.disabled, vec![2]);
        assert_eq!(config.demux.pes_buf_count, 16);
    }

    #[test]
    fn test_invalid_s2p() {
        let err = Config::from_toml(
            r#"
            [device]
            inputs = [{ mode = "serial", s2p_id = 5 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_pool_sizes_bounded() {
        let err = Config::from_toml(
            r#"
            [demux]
            pes_buf_count = 70000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml(
            r#"
            [demux.small_section]
            enable = true
            bufsize = 1048576
            max_len = 8
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            Config::from_toml("[demux\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
