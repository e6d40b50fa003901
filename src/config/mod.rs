//! Engine configuration.
//!
//! All tunables the engine core reads, deserialized from YAML with
//! per-field defaults so a minimal file (or none at all) yields a
//! working configuration. The embedding platform typically builds the
//! config programmatically and only tests load it from files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("cipher suite key length must be 128 or 256, got {0}")]
    InvalidCipherSuite(u16),

    #[error("missing required url: {0}")]
    MissingUrl(&'static str),
}

/// Which dataplane the egress service should provision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatapathProtocol {
    Ipsec,
    #[default]
    Bridge,
    Ike,
}

impl DatapathProtocol {
    /// Name used on the wire in the egress request.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DatapathProtocol::Ipsec => "IPSEC",
            DatapathProtocol::Bridge => "BRIDGE",
            DatapathProtocol::Ike => "IKE",
        }
    }
}

/// Granularity of the exit location carried in public metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpGeoLevel {
    #[default]
    Country,
    City,
}

/// Root engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Auth (sign) service URL.
    #[serde(default)]
    pub zinc_url: String,

    /// Egress (add-egress) service URL.
    #[serde(default)]
    pub brass_url: String,

    /// Initial-data URL (signing key + public metadata descriptor).
    #[serde(default)]
    pub initial_data_url: String,

    /// Path-info update URL for downlink MTU reports.
    #[serde(default)]
    pub update_path_info_url: String,

    /// Service type bound into tokens and requests.
    #[serde(default)]
    pub service_type: String,

    /// Allowed suffixes for a server-supplied control plane hostname.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copper_hostname_suffix: Vec<String>,

    /// Overrides any server-supplied control plane hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copper_hostname_override: Option<String>,

    /// Region code sent with the egress request (may be empty).
    #[serde(default)]
    pub region_code: String,

    #[serde(default)]
    pub datapath_protocol: DatapathProtocol,

    /// AES-GCM key length in bits: 128 or 256.
    #[serde(default = "EngineConfig::default_cipher_suite_key_length")]
    pub cipher_suite_key_length: u16,

    /// Interval between rekeys.
    #[serde(default = "EngineConfig::default_rekey_duration_secs")]
    pub rekey_duration_secs: u64,

    #[serde(default = "EngineConfig::default_true")]
    pub enable_blind_signing: bool,

    /// Arm a watchdog while the datapath is connecting.
    #[serde(default)]
    pub datapath_connecting_timer_enabled: bool,

    #[serde(default = "EngineConfig::default_datapath_connecting_timer_msec")]
    pub datapath_connecting_timer_msec: u64,

    /// Let the datapath negotiate per-path MTU and report updates.
    #[serde(default)]
    pub dynamic_mtu_enabled: bool,

    /// Bind tokens to public metadata (initial-data flow).
    #[serde(default)]
    pub public_metadata_enabled: bool,

    /// Request and attach device attestation during auth.
    #[serde(default)]
    pub integrity_attestation_enabled: bool,

    #[serde(default)]
    pub ip_geo_level: IpGeoLevel,

    /// Attach the OAuth token as an Authorization header instead of a
    /// body field.
    #[serde(default = "EngineConfig::default_true")]
    pub attach_oauth_token_as_header: bool,

    /// Whether IPv6 egress endpoints may be used.
    #[serde(default = "EngineConfig::default_true")]
    pub ipv6_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// First reconnect backoff step.
    #[serde(default = "EngineConfig::default_initial_time_to_reconnect_msec")]
    pub initial_time_to_reconnect_msec: u64,

    /// Deadline for a session to reach the connected state; also the
    /// backoff cap.
    #[serde(default = "EngineConfig::default_session_connection_deadline_msec")]
    pub session_connection_deadline_msec: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zinc_url: String::new(),
            brass_url: String::new(),
            initial_data_url: String::new(),
            update_path_info_url: String::new(),
            service_type: String::new(),
            copper_hostname_suffix: Vec::new(),
            copper_hostname_override: None,
            region_code: String::new(),
            datapath_protocol: DatapathProtocol::Bridge,
            cipher_suite_key_length: 128,
            rekey_duration_secs: 24 * 60 * 60,
            enable_blind_signing: true,
            datapath_connecting_timer_enabled: false,
            datapath_connecting_timer_msec: 10_000,
            dynamic_mtu_enabled: false,
            public_metadata_enabled: false,
            integrity_attestation_enabled: false,
            ip_geo_level: IpGeoLevel::Country,
            attach_oauth_token_as_header: true,
            ipv6_enabled: true,
            api_key: None,
            initial_time_to_reconnect_msec: 1000,
            session_connection_deadline_msec: 30_000,
        }
    }
}

impl EngineConfig {
    fn default_cipher_suite_key_length() -> u16 {
        128
    }
    fn default_rekey_duration_secs() -> u64 {
        24 * 60 * 60
    }
    fn default_datapath_connecting_timer_msec() -> u64 {
        10_000
    }
    fn default_initial_time_to_reconnect_msec() -> u64 {
        1000
    }
    fn default_session_connection_deadline_msec() -> u64 {
        30_000
    }
    fn default_true() -> bool {
        true
    }

    /// Load configuration from a YAML file and validate it.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cipher_suite_key_length != 128 && self.cipher_suite_key_length != 256 {
            return Err(ConfigError::InvalidCipherSuite(self.cipher_suite_key_length));
        }
        if self.zinc_url.is_empty() {
            return Err(ConfigError::MissingUrl("zinc_url"));
        }
        if self.brass_url.is_empty() {
            return Err(ConfigError::MissingUrl("brass_url"));
        }
        Ok(())
    }

    pub fn rekey_duration(&self) -> Duration {
        Duration::from_secs(self.rekey_duration_secs)
    }

    pub fn datapath_connecting_timer_duration(&self) -> Duration {
        Duration::from_millis(self.datapath_connecting_timer_msec)
    }

    pub fn initial_time_to_reconnect(&self) -> Duration {
        Duration::from_millis(self.initial_time_to_reconnect_msec)
    }

    pub fn session_connection_deadline(&self) -> Duration {
        Duration::from_millis(self.session_connection_deadline_msec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cipher_suite_key_length, 128);
        assert_eq!(config.rekey_duration(), Duration::from_secs(86_400));
        assert_eq!(
            config.datapath_connecting_timer_duration(),
            Duration::from_secs(10)
        );
        assert_eq!(config.datapath_protocol, DatapathProtocol::Bridge);
        assert!(config.attach_oauth_token_as_header);
        assert!(config.ipv6_enabled);
    }

    #[test]
    fn test_validate_cipher_suite() {
        let mut config = EngineConfig {
            zinc_url: "https://auth".into(),
            brass_url: "https://egress".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.cipher_suite_key_length = 256;
        assert!(config.validate().is_ok());

        config.cipher_suite_key_length = 192;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCipherSuite(192))
        ));
    }

    #[test]
    fn test_validate_missing_urls() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingUrl("zinc_url"))
        ));
    }

    #[test]
    fn test_yaml_defaults_fill_in() {
        let yaml = r#"
zinc_url: "https://auth.example/v1/authandsign"
brass_url: "https://egress.example/v1/addegress"
service_type: "service_type"
datapath_protocol: bridge
cipher_suite_key_length: 256
public_metadata_enabled: true
copper_hostname_suffix:
  - ".p.example.com"
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cipher_suite_key_length, 256);
        assert!(config.public_metadata_enabled);
        assert_eq!(config.copper_hostname_suffix, vec![".p.example.com"]);
        // Unspecified fields take defaults.
        assert_eq!(config.rekey_duration_secs, 86_400);
        assert!(config.enable_blind_signing);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(DatapathProtocol::Ipsec.wire_name(), "IPSEC");
        assert_eq!(DatapathProtocol::Bridge.wire_name(), "BRIDGE");
        assert_eq!(DatapathProtocol::Ike.wire_name(), "IKE");
    }
}
