//! Error types for the Bluetooth media back-end

use thiserror::Error;

use crate::bus::BusError;

/// Main error type for the back-end
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data loop error: {0}")]
    DataLoop(&'static str),

    #[error("ISO error: {0}")]
    Iso(String),

    #[error("Monitor has shut down")]
    Shutdown,
}

/// Transport lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not found: {0}")]
    NotFound(String),

    #[error("Too many transport errors, not acquiring {0}")]
    TooManyErrors(String),

    #[error("Transport {0} is not acquired")]
    NotAcquired(String),
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCaps(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Codec {0} has no session implementation")]
    NoSession(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Operation not supported by codec {0}")]
    Unsupported(String),
}

/// Device and codec-switch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Codec switching not supported on this adapter")]
    SwitchNotSupported,

    #[error("No enabled codec is supported by the device")]
    NoCodec,

    #[error("No remote endpoint accepted any codec configuration")]
    NoEndpoint,

    #[error("Codec switch superseded by a newer request")]
    Superseded,

    #[error("Device was removed")]
    Removed,
}

impl DeviceError {
    /// Errno-style status used in codec-switch notifications
    pub fn status(&self) -> i32 {
        match self {
            DeviceError::NotFound(_) | DeviceError::NoEndpoint | DeviceError::Removed => -19, // ENODEV
            DeviceError::SwitchNotSupported => -95, // ENOTSUP
            DeviceError::NoCodec => -22,            // EINVAL
            DeviceError::Superseded => -125,        // ECANCELED
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown profile role: {0}")]
    UnknownRole(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Result type alias for the back-end
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_status() {
        assert_eq!(DeviceError::NoEndpoint.status(), -19);
        assert_eq!(DeviceError::SwitchNotSupported.status(), -95);
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = TransportError::TooManyErrors("/t".into()).into();
        assert!(matches!(err, Error::Transport(TransportError::TooManyErrors(_))));
        assert!(err.to_string().contains("Too many transport errors"));
    }
}
