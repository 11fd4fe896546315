//! Server configuration: YAML file pointed to by `POSTBUS_CONFIG`, with
//! defaults for every field.

use crate::error::ServerError;
use postbus_core::limits;
use postbus_core::ConnectionLimits;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7411;

/// Default compression threshold in bytes.
pub const DEFAULT_MIN_COMPRESSION_SIZE: usize = 1024;

/// Full server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub network: NetworkSettings,
    pub limits: LimitsSettings,
    pub filters: FilterSettings,
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSettings {
    /// Address and port the server binds.
    pub bind_addr: String,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsSettings {
    /// Minimum footprint charged per request before bloating.
    pub basic_request_size: u64,
    /// Multiplier applied to the serialized size when estimating cost.
    pub bloat_factor: f64,
    /// Admission budget shared by all connections of this instance.
    pub max_memory_per_core: u64,
    /// Deadline for reading a body after its header, in milliseconds.
    pub body_parse_timeout_ms: u64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            basic_request_size: limits::DEFAULT_BASIC_REQUEST_SIZE,
            bloat_factor: limits::DEFAULT_BLOAT_FACTOR,
            max_memory_per_core: limits::DEFAULT_MAX_MEMORY,
            body_parse_timeout_ms: limits::DEFAULT_BODY_PARSE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LimitsSettings {
    pub fn to_limits(&self) -> ConnectionLimits {
        ConnectionLimits::new(
            self.basic_request_size,
            self.bloat_factor,
            self.max_memory_per_core,
            Duration::from_millis(self.body_parse_timeout_ms),
        )
    }
}

/// Which compression codec the built-in filters speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionChoice {
    #[default]
    None,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    /// Bodies at or below this size are never compressed.
    pub min_compression_size: usize,
    pub compression: CompressionChoice,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            min_compression_size: DEFAULT_MIN_COMPRESSION_SIZE,
            compression: CompressionChoice::None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Require and verify a client certificate against this CA.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsSettings {
    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() || self.key_path.is_none() {
            return Err(ServerError::Config(
                "tls.enabled requires tls.cert_path and tls.key_path".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Loads configuration from the file named by `POSTBUS_CONFIG`, or
    /// returns defaults when the variable is unset.
    pub fn load() -> Result<Self, ServerError> {
        match std::env::var("POSTBUS_CONFIG") {
            Ok(path) => Self::load_from(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &str) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {}: {}", path, e)))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("cannot parse {}: {}", path, e)))?;
        config.tls.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr, "127.0.0.1:7411");
        assert!(config.network.nodelay);
        assert_eq!(config.limits.basic_request_size, 1024);
        assert_eq!(config.filters.min_compression_size, 1024);
        assert_eq!(config.filters.compression, CompressionChoice::None);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
network:
  bind_addr: "0.0.0.0:9000"
limits:
  max_memory_per_core: 4194304
  body_parse_timeout_ms: 500
filters:
  compression: zstd
  min_compression_size: 512
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.limits.max_memory_per_core, 4 * 1024 * 1024);
        assert_eq!(config.filters.compression, CompressionChoice::Zstd);

        let limits = config.limits.to_limits();
        assert_eq!(limits.max_memory, 4 * 1024 * 1024);
        assert_eq!(limits.max_body_parse_duration, Duration::from_millis(500));
    }

    #[test]
    fn test_tls_validation() {
        let tls = TlsSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(tls.validate().is_err());

        let tls = TlsSettings {
            enabled: true,
            cert_path: Some("cert.pem".into()),
            key_path: Some("key.pem".into()),
            client_ca_path: None,
        };
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "network:\n  bind_addr: \"127.0.0.1:1\"\n  frobnicate: true\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
