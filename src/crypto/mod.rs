//! Session key material.
//!
//! One [`SessionCrypto`] lives per provisioning attempt: an ephemeral
//! X25519 pair for the ECDH with the egress server, a 16-byte client
//! nonce, a client-chosen downlink SPI, and an Ed25519 pair whose
//! public half is registered with the server as the rekey verification
//! key. On rekey a fresh instance is created and its public value is
//! signed with the previous instance's Ed25519 key.
//!
//! Transform keys are derived with HKDF-SHA256:
//! salt = client_nonce ‖ server_nonce, ikm = X25519 shared secret.
//!
//! Bridge expansion (16- or 32-byte keys by suite):
//! ```text
//! +---------------------------+-----------------------------+
//! | Uplink Key (16/32)        | Downlink Key (16/32)        |
//! +---------------------------+-----------------------------+
//! ```
//!
//! IPsec expansion (72 bytes):
//! ```text
//! +------------------+------------------+---------+---------+
//! | Uplink Key (32)  | Downlink Key (32)| USalt(4)| DSalt(4)|
//! +------------------+------------------+---------+---------+
//! ```

use crate::config::{DatapathProtocol, EngineConfig};
use crate::datapath::{BridgeTransformParams, IpsecTransformParams, TransformParams};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Client and server nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// X25519 public value length in bytes.
pub const PUBLIC_VALUE_LEN: usize = 32;

/// HKDF context string for transform key expansion.
const KDF_INFO: &[u8] = b"opal transform keys";

const IPSEC_KEY_LEN: usize = 32;
const IPSEC_SALT_LEN: usize = 4;
const IPSEC_HKDF_LEN: usize = 2 * IPSEC_KEY_LEN + 2 * IPSEC_SALT_LEN;

/// Errors from session key material handling.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("server public value must be {PUBLIC_VALUE_LEN} bytes, got {0}")]
    InvalidPublicValueLength(usize),

    #[error("server nonce must be {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("server public value produced a degenerate shared secret")]
    DegenerateSharedSecret,

    #[error("remote key material has not been set")]
    MissingRemoteKeyMaterial,

    #[error("unsupported cipher suite key length: {0}")]
    UnsupportedKeyLength(u16),

    #[error("no transform keys for datapath protocol {0:?}")]
    UnsupportedProtocol(DatapathProtocol),
}

/// Ephemeral key material for one provisioned session epoch.
pub struct SessionCrypto {
    secret: StaticSecret,
    public_value: X25519PublicKey,
    client_nonce: [u8; NONCE_LEN],
    downlink_spi: u32,
    signing_key: SigningKey,
    remote_public_value: Option<[u8; PUBLIC_VALUE_LEN]>,
    remote_nonce: Option<[u8; NONCE_LEN]>,
    /// Signature over our public value by the previous epoch's signing
    /// key. Present only on rekey.
    rekey_signature: Option<Vec<u8>>,
    datapath_protocol: DatapathProtocol,
    cipher_suite_key_length: u16,
}

impl SessionCrypto {
    pub fn new(config: &EngineConfig) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_value = X25519PublicKey::from(&secret);

        let mut client_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut client_nonce);

        // SPI zero is reserved on the wire.
        let downlink_spi = loop {
            let spi = OsRng.next_u32();
            if spi != 0 {
                break spi;
            }
        };

        Self {
            secret,
            public_value,
            client_nonce,
            downlink_spi,
            signing_key: SigningKey::generate(&mut OsRng),
            remote_public_value: None,
            remote_nonce: None,
            rekey_signature: None,
            datapath_protocol: config.datapath_protocol,
            cipher_suite_key_length: config.cipher_suite_key_length,
        }
    }

    pub fn public_value(&self) -> [u8; PUBLIC_VALUE_LEN] {
        self.public_value.to_bytes()
    }

    pub fn client_nonce(&self) -> [u8; NONCE_LEN] {
        self.client_nonce
    }

    pub fn downlink_spi(&self) -> u32 {
        self.downlink_spi
    }

    /// Ed25519 verifying key the server uses to authenticate rekeys.
    pub fn rekey_verification_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary data with the rekey signing key. Used to sign the
    /// next epoch's public value and path-info MTU updates.
    pub fn generate_signature(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Record the signature the previous epoch made over our public
    /// value; sent to the egress service with the rekey request.
    pub fn set_rekey_signature(&mut self, signature: Vec<u8>) {
        self.rekey_signature = Some(signature);
    }

    pub fn rekey_signature(&self) -> Option<&[u8]> {
        self.rekey_signature.as_deref()
    }

    /// Install the server's public value and nonce from the egress
    /// response, validating lengths.
    pub fn set_remote_key_material(
        &mut self,
        public_value: &[u8],
        nonce: &[u8],
    ) -> Result<(), CryptoError> {
        if public_value.len() != PUBLIC_VALUE_LEN {
            return Err(CryptoError::InvalidPublicValueLength(public_value.len()));
        }
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength(nonce.len()));
        }

        let mut value = [0u8; PUBLIC_VALUE_LEN];
        value.copy_from_slice(public_value);
        self.remote_public_value = Some(value);

        let mut server_nonce = [0u8; NONCE_LEN];
        server_nonce.copy_from_slice(nonce);
        self.remote_nonce = Some(server_nonce);
        Ok(())
    }

    fn shared_secret(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let remote = self
            .remote_public_value
            .ok_or(CryptoError::MissingRemoteKeyMaterial)?;
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(CryptoError::DegenerateSharedSecret);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    fn expand_keys(&self, output_len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let remote_nonce = self
            .remote_nonce
            .ok_or(CryptoError::MissingRemoteKeyMaterial)?;
        let shared = self.shared_secret()?;

        let mut salt = [0u8; 2 * NONCE_LEN];
        salt[..NONCE_LEN].copy_from_slice(&self.client_nonce);
        salt[NONCE_LEN..].copy_from_slice(&remote_nonce);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_ref());
        let mut okm = Zeroizing::new(vec![0u8; output_len]);
        hkdf.expand(KDF_INFO, &mut okm)
            .expect("transform key expansion fits HKDF output limit");
        Ok(okm)
    }

    fn bridge_transform_params(&self) -> Result<TransformParams, CryptoError> {
        let key_len = match self.cipher_suite_key_length {
            128 => 16,
            256 => 32,
            other => return Err(CryptoError::UnsupportedKeyLength(other)),
        };
        let okm = self.expand_keys(2 * key_len)?;
        Ok(TransformParams::Bridge(BridgeTransformParams {
            uplink_key: okm[..key_len].to_vec(),
            downlink_key: okm[key_len..].to_vec(),
        }))
    }

    fn ipsec_transform_params(&self) -> Result<TransformParams, CryptoError> {
        let okm = self.expand_keys(IPSEC_HKDF_LEN)?;
        let (uplink_key, rest) = okm.split_at(IPSEC_KEY_LEN);
        let (downlink_key, rest) = rest.split_at(IPSEC_KEY_LEN);
        let (uplink_salt, downlink_salt) = rest.split_at(IPSEC_SALT_LEN);
        Ok(TransformParams::Ipsec(IpsecTransformParams {
            uplink_key: uplink_key.to_vec(),
            downlink_key: downlink_key.to_vec(),
            uplink_salt: uplink_salt.to_vec(),
            downlink_salt: downlink_salt.to_vec(),
            downlink_spi: self.downlink_spi,
        }))
    }

    /// Derive the transform parameters for the configured dataplane.
    /// Requires remote key material.
    pub fn derive_transform_params(&self) -> Result<TransformParams, CryptoError> {
        match self.datapath_protocol {
            DatapathProtocol::Bridge => self.bridge_transform_params(),
            DatapathProtocol::Ipsec => self.ipsec_transform_params(),
            DatapathProtocol::Ike => {
                Err(CryptoError::UnsupportedProtocol(DatapathProtocol::Ike))
            }
        }
    }
}
