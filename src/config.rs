//! Back-end configuration
//!
//! Loaded from TOML; every field has a default so an empty file (or no file
//! at all) yields a working setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::ConfigError;
use crate::profile::Profiles;

/// HFP/HSP backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HfpBackend {
    /// No headset audio at all
    None,
    /// First backend that becomes available
    #[default]
    Any,
    /// A specific backend, e.g. `native` or `ofono`
    Named(String),
}

impl From<String> for HfpBackend {
    fn from(value: String) -> Self {
        match value.as_str() {
            "none" => HfpBackend::None,
            "any" => HfpBackend::Any,
            _ => HfpBackend::Named(value),
        }
    }
}

impl From<HfpBackend> for String {
    fn from(value: HfpBackend) -> Self {
        match value {
            HfpBackend::None => "none".into(),
            HfpBackend::Any => "any".into(),
            HfpBackend::Named(name) => name,
        }
    }
}

/// Decode buffer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DecodeBufferConfig {
    /// Fixed target latency; automatic when absent
    pub target_latency_ms: Option<u32>,
    /// Rate controller averaging window
    pub averaging_window_ms: u32,
    /// Maximum rate correction, as a fraction of nominal
    pub max_rate_diff: f64,
    /// Upper bound for automatically chosen latency above one period
    pub max_extra_latency_ms: Option<u32>,
}

impl Default for DecodeBufferConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: None,
            averaging_window_ms: constants::BUFFERING_SHORT_MSEC,
            max_rate_diff: constants::RATE_DIFF_MAX,
            max_extra_latency_ms: None,
        }
    }
}

/// Empirically tuned timing constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimingConfig {
    /// Minimum spacing between Bluetooth-service RPCs for one device
    pub bluez_action_rate_ms: u64,
    /// Reconnect retry period
    pub reconnect_retry_ms: u64,
    /// Absolute ceiling for waiting on profiles to connect
    pub profile_timeout_ms: u64,
    /// Delay before an unused active transport is released
    pub transport_release_ms: u64,
    /// Acquire failures tolerated within the error window
    pub transport_error_max_retry: u32,
    /// ISO group pause after a stream (re)joins
    pub iso_resync_pause_ms: u64,
    /// Maximum number of lost packets concealed at once
    pub max_plc_packets: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bluez_action_rate_ms: 3000,
            reconnect_retry_ms: 2000,
            profile_timeout_ms: 6000,
            transport_release_ms: 1000,
            transport_error_max_retry: 3,
            iso_resync_pause_ms: 100,
            max_plc_packets: constants::MAX_PLC_PACKETS,
        }
    }
}

impl TimingConfig {
    pub fn bluez_action_rate(&self) -> Duration {
        Duration::from_millis(self.bluez_action_rate_ms)
    }

    /// Window within which acquire errors are counted
    pub fn transport_error_window(&self) -> Duration {
        self.bluez_action_rate() * 2
    }

    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_ms)
    }

    pub fn profile_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_timeout_ms)
    }

    pub fn transport_release(&self) -> Duration {
        Duration::from_millis(self.transport_release_ms)
    }

    pub fn iso_resync_pause(&self) -> Duration {
        Duration::from_millis(self.iso_resync_pause_ms)
    }
}

/// Back-end configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Enabled codecs by name, in no particular order; all when absent
    pub codecs: Option<Vec<String>>,
    /// Enabled profile roles by name (`a2dp_sink`, `hfp_hf`, `bap`, ...)
    pub roles: Option<Vec<String>>,
    pub default_rate: u32,
    pub default_channels: u16,
    #[serde(rename = "hfphsp-backend")]
    pub hfp_backend: HfpBackend,
    pub decode_buffer: DecodeBufferConfig,
    /// Profiles the back-end tries to connect itself on trusted devices
    pub reconnect_profiles: Vec<String>,
    /// Publish device battery levels through the adapter battery provider
    pub battery_provider: bool,
    pub timing: TimingConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            codecs: None,
            roles: None,
            default_rate: constants::DEFAULT_SAMPLE_RATE,
            default_channels: constants::DEFAULT_CHANNELS,
            hfp_backend: HfpBackend::default(),
            decode_buffer: DecodeBufferConfig::default(),
            reconnect_profiles: vec!["hfp_hf".into(), "hsp_hs".into(), "a2dp_sink".into()],
            battery_provider: true,
            timing: TimingConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BackendConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Platform config location, e.g. `~/.config/bt-media-backend/backend.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "bt-media", "bt-media-backend")
            .map(|dirs| dirs.config_dir().join("backend.toml"))
    }

    /// Load from the platform config location, falling back to defaults
    /// when no file exists there
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "default-rate",
                message: "must be positive".into(),
            });
        }
        if !(1..=8).contains(&self.default_channels) {
            return Err(ConfigError::Invalid {
                key: "default-channels",
                message: format!("{} out of range 1..=8", self.default_channels),
            });
        }
        let diff = self.decode_buffer.max_rate_diff;
        if !(0.0..0.5).contains(&diff) {
            return Err(ConfigError::Invalid {
                key: "decode-buffer.max-rate-diff",
                message: format!("{diff} out of range [0, 0.5)"),
            });
        }
        if self.decode_buffer.averaging_window_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "decode-buffer.averaging-window-ms",
                message: "must be positive".into(),
            });
        }
        self.enabled_profiles()?;
        self.reconnect_profile_mask()?;
        Ok(())
    }

    fn parse_roles(names: &[String]) -> Result<Profiles, ConfigError> {
        names
            .iter()
            .try_fold(Profiles::NONE, |acc, name| Ok(acc | name.parse::<Profiles>()?))
    }

    /// Local roles the back-end registers endpoints and accepts transports for
    pub fn enabled_profiles(&self) -> Result<Profiles, ConfigError> {
        let mut mask = match &self.roles {
            Some(names) => Self::parse_roles(names)?,
            None => Profiles::ALL,
        };
        if self.hfp_backend == HfpBackend::None {
            mask.remove(Profiles::HEADSET_AUDIO);
        }
        Ok(mask)
    }

    pub fn reconnect_profile_mask(&self) -> Result<Profiles, ConfigError> {
        Self::parse_roles(&self.reconnect_profiles)
    }

    /// Whether the codec allow-list admits `name`
    pub fn codec_enabled(&self, name: &str) -> bool {
        self.codecs
            .as_ref()
            .map_or(true, |list| list.iter().any(|c| c == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = BackendConfig::from_toml_str("").unwrap();
        assert_eq!(config, BackendConfig::default());
        assert_eq!(config.timing.bluez_action_rate(), Duration::from_secs(3));
        assert_eq!(config.timing.transport_error_window(), Duration::from_secs(6));
    }

    #[test]
    fn test_parse_full_document() {
        let config = BackendConfig::from_toml_str(
            r#"
            codecs = ["sbc", "aac"]
            roles = ["a2dp_sink", "hfp_hf"]
            default-rate = 44100
            hfphsp-backend = "native"
            reconnect-profiles = ["a2dp_sink"]

            [decode-buffer]
            target-latency-ms = 40
            max-rate-diff = 0.01

            [timing]
            bluez-action-rate-ms = 1500
            "#,
        )
        .unwrap();

        assert!(config.codec_enabled("aac"));
        assert!(!config.codec_enabled("ldac"));
        assert_eq!(config.default_rate, 44100);
        assert_eq!(config.hfp_backend, HfpBackend::Named("native".into()));
        assert_eq!(config.decode_buffer.target_latency_ms, Some(40));
        assert_eq!(config.timing.bluez_action_rate_ms, 1500);
        assert_eq!(config.timing.reconnect_retry_ms, 2000);
        assert_eq!(
            config.enabled_profiles().unwrap(),
            Profiles::A2DP_SINK | Profiles::HFP_HF
        );
        assert_eq!(config.reconnect_profile_mask().unwrap(), Profiles::A2DP_SINK);
    }

    #[test]
    fn test_backend_none_disables_headset_roles() {
        let config = BackendConfig::from_toml_str(r#"hfphsp-backend = "none""#).unwrap();
        let mask = config.enabled_profiles().unwrap();
        assert!(!mask.intersects(Profiles::HEADSET_AUDIO));
        assert!(mask.contains(Profiles::A2DP_DUPLEX));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let err = BackendConfig::from_toml_str(r#"roles = ["a2dp_sink", "pan"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRole(r) if r == "pan"));
    }

    #[test]
    fn test_invalid_rate_diff_rejected() {
        let err = BackendConfig::from_toml_str("[decode-buffer]\nmax-rate-diff = 0.9").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
