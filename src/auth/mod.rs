//! Auth client: blind-signed authorization.
//!
//! Talks to the auth service in two steps: fetch the signing key and
//! public metadata descriptor (initial data), then submit blinded
//! tokens for signing together with the OAuth credential. The output
//! is a set of unblinded tokens the egress request spends, plus the
//! control-plane hostname override the auth service may return.

pub mod metadata;
pub mod tokens;

use crate::config::{EngineConfig, IpGeoLevel};
use crate::http::{HttpRequest, HttpTransport};
use crate::platform::OAuthTokenProvider;
use crate::status::Status;
use crate::telemetry::Telemetry;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use metadata::PublicMetadata;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokens::{AuthToken, BlindToken};
use tracing::{debug, info, warn};

/// Interface version expected from the initial-data response.
const VALIDATION_VERSION: i64 = 1;

/// Everything a successful authentication produced.
#[derive(Clone, Debug, Default)]
pub struct AuthOutcome {
    pub tokens: Vec<AuthToken>,
    /// Control-plane hostname override; empty when the auth service
    /// did not provide one.
    pub copper_controller_hostname: String,
    pub region_token_and_signature: String,
    pub apn_type: String,
    pub signing_key_version: i64,
    pub public_metadata: Option<PublicMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct SigningKeyBody {
    #[serde(default)]
    serialized_public_key: String,
    #[serde(default)]
    key_version: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetadataInfoBody {
    #[serde(default)]
    public_metadata: PublicMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct AttestationBody {
    #[serde(default)]
    attestation_nonce: String,
}

#[derive(Debug, Default, Deserialize)]
struct InitialDataResponseBody {
    #[serde(default)]
    at_public_metadata_public_key: SigningKeyBody,
    #[serde(default)]
    public_metadata_info: PublicMetadataInfoBody,
    #[serde(default)]
    attestation: AttestationBody,
}

#[derive(Debug, Default, Deserialize)]
struct PublicKeyResponseBody {
    #[serde(default)]
    pem: String,
    #[serde(default)]
    attestation_nonce: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthAndSignResponseBody {
    #[serde(default)]
    blinded_token_signature: Vec<String>,
    #[serde(default)]
    copper_controller_hostname: String,
    #[serde(default)]
    region_token_and_signature: String,
    #[serde(default)]
    apn_type: String,
}

/// Client for the auth service.
pub struct AuthClient {
    config: Arc<EngineConfig>,
    http: Arc<dyn HttpTransport>,
    oauth: Arc<dyn OAuthTokenProvider>,
    telemetry: Arc<Telemetry>,
}

impl AuthClient {
    pub fn new(
        config: Arc<EngineConfig>,
        http: Arc<dyn HttpTransport>,
        oauth: Arc<dyn OAuthTokenProvider>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            http,
            oauth,
            telemetry,
        }
    }

    /// Run the full authentication flow. The same entry point serves
    /// rekey; the flag only affects logging since every attempt mints
    /// fresh tokens.
    pub async fn authenticate(&self, is_rekey: bool) -> Result<AuthOutcome, Status> {
        info!(
            is_rekey,
            blind_signing = self.config.enable_blind_signing,
            public_metadata = self.config.public_metadata_enabled,
            "Starting authentication"
        );

        let oauth_start = Instant::now();
        let oauth_token = self.oauth.get_oauth_token().await?;
        self.telemetry.record_oauth_latency(oauth_start.elapsed());

        if !self.config.enable_blind_signing {
            return self
                .auth_and_sign(&oauth_token, Vec::new(), None, 0, None)
                .await
                .map(|(outcome, _)| outcome);
        }

        let (token, metadata, key_version, attestation_nonce) = if self
            .config
            .public_metadata_enabled
        {
            let initial_data = self.request_initial_data(&oauth_token).await?;
            let metadata = initial_data.public_metadata_info.public_metadata;
            metadata.validate(&self.config)?;

            let fingerprint = metadata::fingerprint(&metadata);
            debug!(fingerprint, "Fingerprinted public metadata");
            let token = BlindToken::generate(
                &initial_data.at_public_metadata_public_key.serialized_public_key,
                Some(fingerprint),
            )?;
            (
                token,
                Some(metadata),
                initial_data.at_public_metadata_public_key.key_version,
                non_empty(initial_data.attestation.attestation_nonce),
            )
        } else {
            let response = self.request_public_key(&oauth_token).await?;
            let token = BlindToken::generate(&response.pem, None)?;
            (token, None, 0, non_empty(response.attestation_nonce))
        };

        let attestation = match attestation_nonce {
            Some(nonce) if self.config.integrity_attestation_enabled => {
                Some(self.oauth.get_attestation_data(&nonce).await?)
            }
            _ => None,
        };

        let blinded = vec![token.blinded_token_b64()];
        let (mut outcome, signatures) = self
            .auth_and_sign(
                &oauth_token,
                blinded,
                metadata.as_ref(),
                key_version,
                attestation.as_deref(),
            )
            .await?;

        if signatures.len() != 1 {
            self.telemetry.incr_token_unblind_failures();
            return Err(Status::internal(format!(
                "response signature count does not match request token count: {} != 1",
                signatures.len()
            )));
        }
        let unblinded = token.unblind(&signatures[0]).inspect_err(|_| {
            self.telemetry.incr_token_unblind_failures();
        })?;

        outcome.tokens = vec![unblinded];
        outcome.public_metadata = metadata;
        outcome.signing_key_version = key_version;
        Ok(outcome)
    }

    async fn request_initial_data(
        &self,
        oauth_token: &str,
    ) -> Result<InitialDataResponseBody, Status> {
        let granularity = match self.config.ip_geo_level {
            IpGeoLevel::Country => "COUNTRY",
            IpGeoLevel::City => "CITY_GEOS",
        };
        let mut body = serde_json::json!({
            "use_attestation": self.config.integrity_attestation_enabled,
            "service_type": self.config.service_type,
            "location_granularity": granularity,
            "validation_version": VALIDATION_VERSION,
        });
        if !self.config.attach_oauth_token_as_header {
            body["oauth_token"] = serde_json::json!(oauth_token);
        }

        let request = self.attach_oauth(
            HttpRequest::post_json(&self.config.initial_data_url, body)
                .with_api_key(self.config.api_key.as_deref()),
            oauth_token,
        );

        let request_start = Instant::now();
        let response = self.http.post_json(request).await;
        self.telemetry.record_auth_latency(request_start.elapsed());

        if response.status.code == 401 {
            self.oauth.clear_oauth_token(oauth_token);
        }
        if !response.is_ok() {
            return Err(response.to_status("initial data request"));
        }

        let parsed: InitialDataResponseBody = serde_json::from_value(response.parse_json()?)
            .map_err(|e| Status::invalid_argument(format!("bad initial data response: {}", e)))?;
        if parsed
            .at_public_metadata_public_key
            .serialized_public_key
            .is_empty()
        {
            return Err(Status::invalid_argument(
                "initial data response is missing the signing key",
            ));
        }
        Ok(parsed)
    }

    async fn request_public_key(&self, oauth_token: &str) -> Result<PublicKeyResponseBody, Status> {
        let mut body = serde_json::json!({
            "get_public_key": true,
            "request_nonce": self.config.integrity_attestation_enabled,
        });
        if !self.config.attach_oauth_token_as_header {
            body["oauth_token"] = serde_json::json!(oauth_token);
        }
        let request = self.attach_oauth(
            HttpRequest::post_json(&self.config.initial_data_url, body)
                .with_api_key(self.config.api_key.as_deref()),
            oauth_token,
        );

        let request_start = Instant::now();
        let response = self.http.post_json(request).await;
        self.telemetry.record_auth_latency(request_start.elapsed());

        if response.status.code == 401 {
            self.oauth.clear_oauth_token(oauth_token);
        }
        if !response.is_ok() {
            return Err(response.to_status("public key request"));
        }

        let parsed: PublicKeyResponseBody = serde_json::from_value(response.parse_json()?)
            .map_err(|e| Status::invalid_argument(format!("bad public key response: {}", e)))?;
        if parsed.pem.is_empty() {
            return Err(Status::invalid_argument(
                "public key response is missing the signing key",
            ));
        }
        Ok(parsed)
    }

    async fn auth_and_sign(
        &self,
        oauth_token: &str,
        blinded_tokens: Vec<String>,
        metadata: Option<&PublicMetadata>,
        key_version: i64,
        attestation: Option<&[u8]>,
    ) -> Result<(AuthOutcome, Vec<String>), Status> {
        let mut body = serde_json::json!({
            "service_type": self.config.service_type,
            "blinded_token": blinded_tokens,
        });
        if let Some(metadata) = metadata {
            body["public_metadata_info"] = serde_json::json!({
                "public_metadata": metadata,
            });
            body["key_version"] = serde_json::json!(key_version);
        }
        if let Some(attestation) = attestation {
            body["attestation"] = serde_json::json!(BASE64.encode(attestation));
        }
        if !self.config.attach_oauth_token_as_header {
            body["oauth_token"] = serde_json::json!(oauth_token);
        }

        let request = self.attach_oauth(
            HttpRequest::post_json(&self.config.zinc_url, body)
                .with_api_key(self.config.api_key.as_deref()),
            oauth_token,
        );

        let request_start = Instant::now();
        let response = self.http.post_json(request).await;
        self.telemetry.record_zinc_latency(request_start.elapsed());

        info!(
            code = response.status.code,
            "Got authentication response"
        );
        if response.status.code == 401 {
            self.oauth.clear_oauth_token(oauth_token);
        }
        if !response.is_ok() {
            return Err(response.to_status("auth and sign request"));
        }

        let parsed: AuthAndSignResponseBody = serde_json::from_value(response.parse_json()?)
            .map_err(|e| Status::invalid_argument(format!("bad auth response: {}", e)))?;

        self.check_copper_hostname(&parsed.copper_controller_hostname)?;

        let outcome = AuthOutcome {
            tokens: Vec::new(),
            copper_controller_hostname: parsed.copper_controller_hostname,
            region_token_and_signature: parsed.region_token_and_signature,
            apn_type: parsed.apn_type,
            signing_key_version: key_version,
            public_metadata: None,
        };
        Ok((outcome, parsed.blinded_token_signature))
    }

    /// A server-supplied control-plane hostname must carry one of the
    /// configured suffixes; an unexpected hostname would let a
    /// compromised auth response redirect the dataplane.
    fn check_copper_hostname(&self, hostname: &str) -> Result<(), Status> {
        if hostname.is_empty() || self.config.copper_hostname_suffix.is_empty() {
            return Ok(());
        }
        for suffix in &self.config.copper_hostname_suffix {
            if hostname.ends_with(suffix) {
                return Ok(());
            }
        }
        warn!(hostname, "Rejecting control-plane hostname");
        Err(Status::invalid_argument(format!(
            "copper_controller_hostname does not have an allowed suffix: {}",
            hostname
        )))
    }

    fn attach_oauth(&self, request: HttpRequest, oauth_token: &str) -> HttpRequest {
        if self.config.attach_oauth_token_as_header {
            request.with_header("Authorization", format!("Bearer {}", oauth_token))
        } else {
            request
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
