//! Blind token material.
//!
//! The client mints a random token message, blinds it against the
//! signing key the auth service advertised, and later unblinds the
//! returned blind signature into a usable, unlinkable token. When
//! public metadata is in play, its fingerprint is appended to the
//! message before blinding so the signature is bound to the metadata.

use crate::status::Status;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blind_rsa_signatures::{BlindSignature, Options, PublicKey as RsaPublicKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the random portion of a token message.
const TOKEN_RANDOM_LEN: usize = 32;

/// A signed, unblinded token ready to be spent on an egress request.
#[derive(Clone, Debug)]
pub struct AuthToken {
    /// The original token message the signature covers.
    pub message: String,
    /// Unblinded RSA signature over the (randomized) message.
    pub signature: Vec<u8>,
    /// Message randomizer the verifier needs alongside the message.
    pub message_mask: Vec<u8>,
}

/// One token's blinding state, alive between the sign request and the
/// response. Consumed by [`BlindToken::unblind`]; single-use.
pub struct BlindToken {
    public_key: RsaPublicKey,
    message: String,
    blind_message: Vec<u8>,
    secret: blind_rsa_signatures::Secret,
    randomizer: Option<blind_rsa_signatures::MessageRandomizer>,
    options: Options,
}

impl BlindToken {
    /// Mint and blind a fresh token against `signing_key_pem`.
    ///
    /// The message is `"blind:" + base64(32 random bytes)`, with the
    /// metadata fingerprint appended as 16 hex digits when present so
    /// the signature binds the metadata the token was issued under.
    pub fn generate(
        signing_key_pem: &str,
        metadata_fingerprint: Option<u64>,
    ) -> Result<Self, Status> {
        let public_key = RsaPublicKey::from_pem(signing_key_pem)
            .map_err(|e| Status::invalid_argument(format!("bad signing key: {}", e)))?;

        let mut random = [0u8; TOKEN_RANDOM_LEN];
        OsRng.fill_bytes(&mut random);
        let mut message = format!("blind:{}", BASE64.encode(random));
        if let Some(fingerprint) = metadata_fingerprint {
            message.push_str(&format!(";{:016x}", fingerprint));
        }

        let options = Options::default();
        let blinding = public_key
            .blind(&mut OsRng, message.as_bytes(), true, &options)
            .map_err(|e| Status::internal(format!("token blinding failed: {}", e)))?;

        Ok(Self {
            public_key,
            message,
            blind_message: blinding.blind_msg.0.clone(),
            secret: blinding.secret,
            randomizer: blinding.msg_randomizer,
            options,
        })
    }

    /// Serialized blinded token for the sign request, base64-encoded.
    pub fn blinded_token_b64(&self) -> String {
        BASE64.encode(&self.blind_message)
    }

    /// Unblind a base64 blind signature from the sign response and
    /// verify it under the signing key.
    pub fn unblind(self, blind_signature_b64: &str) -> Result<AuthToken, Status> {
        let blind_signature = BASE64
            .decode(blind_signature_b64)
            .map_err(|e| Status::invalid_argument(format!("bad blind signature encoding: {}", e)))?;

        let message_mask = self
            .randomizer
            .as_ref()
            .map(|r| r.0.to_vec())
            .unwrap_or_default();
        let signature = self
            .public_key
            .finalize(
                &BlindSignature(blind_signature),
                &self.secret,
                self.randomizer,
                self.message.as_bytes(),
                &self.options,
            )
            .map_err(|e| Status::internal(format!("token unblinding failed: {}", e)))?;

        Ok(AuthToken {
            message: self.message,
            signature: signature.0,
            message_mask,
        })
    }
}
