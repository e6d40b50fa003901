//! Public metadata bound into blind tokens.
//!
//! The auth service advertises the metadata (exit location, service
//! type, expiration) that the issued tokens are valid for. The client
//! validates it against its own configuration and binds a fingerprint
//! of it into every token it has signed.

use crate::config::{EngineConfig, IpGeoLevel};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Token expirations must land on this increment so clients cannot be
/// individually tagged by unusual expiry times.
pub const EXPIRY_INCREMENT_SECS: i64 = 15 * 60;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitLocation {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city_geo_id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub nanos: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMetadata {
    #[serde(default)]
    pub exit_location: ExitLocation,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub expiration: Expiration,
}

impl PublicMetadata {
    /// Validate server-supplied metadata against the configuration.
    pub fn validate(&self, config: &EngineConfig) -> Result<(), Status> {
        if self.expiration.nanos != 0 || self.expiration.seconds % EXPIRY_INCREMENT_SECS != 0 {
            return Err(Status::internal(
                "public metadata expiration is not rounded to the expiry increment",
            ));
        }
        if config.ip_geo_level != IpGeoLevel::City && !self.exit_location.city_geo_id.is_empty() {
            return Err(Status::internal(
                "received city_geo_id when request specified a coarser geo level",
            ));
        }
        if self.service_type != config.service_type {
            return Err(Status::internal(
                "public metadata service type does not match configuration",
            ));
        }
        Ok(())
    }
}

fn omit_default(value: i64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}

/// Deterministic fingerprint of public metadata.
///
/// Fields are concatenated in tag order, omitting values equal to the
/// default so new fields can be added without changing existing
/// encodings. The fingerprint is the first 8 bytes of the SHA-256
/// digest, big-endian.
pub fn fingerprint(metadata: &PublicMetadata) -> u64 {
    let input = format!(
        "{}{}{}{}{}",
        metadata.exit_location.country,
        metadata.exit_location.city_geo_id,
        metadata.service_type,
        omit_default(metadata.expiration.seconds),
        omit_default(metadata.expiration.nanos as i64),
    );
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
