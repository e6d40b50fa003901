//! Provision orchestrator.
//!
//! Sequences one provisioning attempt — authenticate, resolve the
//! control-plane address, add egress, derive transform keys — as an
//! async pipeline whose completion is posted back into the session
//! queue. At most one attempt is in flight per session.
//!
//! Rekey epochs are two-phase: the fresh [`SessionCrypto`] created for
//! the rekey request is held as *pending* until the session confirms
//! the datapath installed the new keys, at which point `commit_rekey`
//! promotes it. A failed installation abandons the pending epoch and
//! the previous keys remain authoritative.

use crate::auth::{AuthClient, AuthOutcome};
use crate::config::EngineConfig;
use crate::crypto::SessionCrypto;
use crate::datapath::TransformParams;
use crate::egress::{AddEgressParams, EgressClient, ProvisionedDataplane};
use crate::http::HttpTransport;
use crate::platform::OAuthTokenProvider;
use crate::session::events::SessionEvent;
use crate::status::Status;
use crate::telemetry::Telemetry;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Port the control plane listens on at the resolved egress host.
const CONTROL_PLANE_PORT: u16 = 1849;

#[derive(Default)]
struct ProvisionState {
    /// Committed crypto epoch; signs path-info updates and the next
    /// rekey's public value.
    crypto: Option<SessionCrypto>,
    /// Epoch awaiting datapath key installation.
    pending_crypto: Option<SessionCrypto>,
    /// Resolved once at first provisioning, reused for rekeys.
    control_plane_sockaddr: String,
    apn_type: String,
    /// Uplink SPI of the committed epoch; previous SPI for rekeys.
    uplink_spi: u32,
}

/// Drives Auth → Egress and owns the session's crypto epochs.
pub struct Provisioner {
    config: Arc<EngineConfig>,
    http: Arc<dyn HttpTransport>,
    auth: AuthClient,
    egress: EgressClient,
    state: Mutex<ProvisionState>,
    in_flight: AtomicBool,
    stopped: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Provisioner {
    pub fn new(
        config: Arc<EngineConfig>,
        http: Arc<dyn HttpTransport>,
        oauth: Arc<dyn OAuthTokenProvider>,
        telemetry: Arc<Telemetry>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            auth: AuthClient::new(
                Arc::clone(&config),
                Arc::clone(&http),
                oauth,
                Arc::clone(&telemetry),
            ),
            egress: EgressClient::new(Arc::clone(&config), Arc::clone(&http), telemetry),
            config,
            http,
            state: Mutex::new(ProvisionState::default()),
            in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events,
        }
    }

    /// Kick off one provisioning attempt. Rejected while another is in
    /// flight.
    pub fn start(self: &Arc<Self>, is_rekey: bool) -> Result<(), Status> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Status::failed_precondition(
                "provisioning is already in flight",
            ));
        }
        if is_rekey && self.state.lock().expect("provision mutex poisoned").crypto.is_none() {
            self.in_flight.store(false, Ordering::Release);
            return Err(Status::failed_precondition(
                "rekey requested before initial provisioning",
            ));
        }

        info!(is_rekey, "Starting provisioning");
        let provisioner = Arc::clone(self);
        tokio::spawn(async move {
            let result = provisioner.run(is_rekey).await;
            provisioner.in_flight.store(false, Ordering::Release);
            if provisioner.stopped.load(Ordering::Acquire) {
                return;
            }
            let event = match result {
                Ok((dataplane, transform_params)) => SessionEvent::Provisioned {
                    dataplane: Box::new(dataplane),
                    transform_params,
                    is_rekey,
                },
                Err(status) => {
                    error!(%status, is_rekey, "Provisioning failed");
                    let permanent = status.is_permanent();
                    SessionEvent::ProvisioningFailure { status, permanent }
                }
            };
            let _ = provisioner.events.send(event);
        });
        Ok(())
    }

    /// Drop late completions once the session is stopping.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    async fn run(
        &self,
        is_rekey: bool,
    ) -> Result<(ProvisionedDataplane, Option<TransformParams>), Status> {
        let outcome = self.auth.authenticate(is_rekey).await?;

        // Fresh epoch for this attempt. On rekey its public value is
        // signed by the committed epoch so the server can authenticate
        // the key change.
        let mut crypto = SessionCrypto::new(&self.config);
        if is_rekey {
            let state = self.state.lock().expect("provision mutex poisoned");
            let committed = state
                .crypto
                .as_ref()
                .ok_or_else(|| Status::failed_precondition("committed crypto epoch is gone"))?;
            let signature = committed.generate_signature(&crypto.public_value());
            drop(state);
            crypto.set_rekey_signature(signature.to_vec());
        } else {
            let sockaddr = self.resolve_control_plane(&outcome).await?;
            let mut state = self.state.lock().expect("provision mutex poisoned");
            state.control_plane_sockaddr = sockaddr;
            state.apn_type = outcome.apn_type.clone();
        }

        let params = self.build_egress_params(is_rekey, &outcome, &crypto)?;
        let dataplane = self.egress.add_egress(&params).await?;

        match &dataplane {
            ProvisionedDataplane::Ppn(egress) => {
                crypto.set_remote_key_material(&egress.egress_public_value, &egress.server_nonce)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                let transform_params = crypto
                    .derive_transform_params()
                    .map_err(|e| Status::internal(e.to_string()))?;

                let mut state = self.state.lock().expect("provision mutex poisoned");
                if is_rekey {
                    state.pending_crypto = Some(crypto);
                } else {
                    state.uplink_spi = egress.uplink_spi;
                    state.crypto = Some(crypto);
                }
                Ok((dataplane, Some(transform_params)))
            }
            ProvisionedDataplane::Ike(_) => {
                // The IKE variant carries its own auth material; no
                // transform keys are derived on this side.
                Ok((dataplane, None))
            }
        }
    }

    fn build_egress_params(
        &self,
        is_rekey: bool,
        outcome: &AuthOutcome,
        crypto: &SessionCrypto,
    ) -> Result<AddEgressParams, Status> {
        let state = self.state.lock().expect("provision mutex poisoned");
        let token = outcome.tokens.first();
        if self.config.enable_blind_signing && token.is_none() {
            return Err(Status::failed_precondition(
                "no signed tokens available for the egress request",
            ));
        }

        Ok(AddEgressParams {
            is_rekey,
            unblinded_token: token.map(|t| t.message.clone()).unwrap_or_default(),
            unblinded_token_signature: token.map(|t| t.signature.clone()).unwrap_or_default(),
            message_mask: token.map(|t| t.message_mask.clone()).unwrap_or_default(),
            region_token_and_signature: outcome.region_token_and_signature.clone(),
            signing_key_version: outcome.signing_key_version,
            public_metadata: outcome.public_metadata.clone(),
            client_public_value: crypto.public_value(),
            client_nonce: crypto.client_nonce(),
            rekey_verification_key: crypto.rekey_verification_key(),
            rekey_signature: crypto.rekey_signature().map(|s| s.to_vec()),
            downlink_spi: crypto.downlink_spi(),
            previous_uplink_spi: if is_rekey { state.uplink_spi } else { 0 },
            control_plane_sockaddr: state.control_plane_sockaddr.clone(),
            apn_type: if is_rekey {
                state.apn_type.clone()
            } else {
                outcome.apn_type.clone()
            },
            dynamic_mtu_enabled: self.config.dynamic_mtu_enabled,
        })
    }

    /// Resolve the control-plane hostname: explicit override first,
    /// then whatever the auth service returned.
    async fn resolve_control_plane(&self, outcome: &AuthOutcome) -> Result<String, Status> {
        let hostname = self
            .config
            .copper_hostname_override
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&outcome.copper_controller_hostname);
        if hostname.is_empty() {
            return Err(Status::failed_precondition(
                "no control plane hostname available",
            ));
        }

        info!(hostname, "Resolving control plane hostname");
        let resolved = self.http.lookup_dns(hostname).await?;
        let ip: IpAddr = resolved.parse().map_err(|_| {
            Status::invalid_argument(format!("DNS returned a malformed address: {}", resolved))
        })?;
        let sockaddr = match ip {
            IpAddr::V4(v4) => format!("{}:{}", v4, CONTROL_PLANE_PORT),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, CONTROL_PLANE_PORT),
        };
        info!(sockaddr, "Control plane resolved");
        Ok(sockaddr)
    }

    /// Promote the pending rekey epoch after the datapath confirmed
    /// the new keys.
    pub fn commit_rekey(&self, uplink_spi: u32) {
        let mut state = self.state.lock().expect("provision mutex poisoned");
        match state.pending_crypto.take() {
            Some(crypto) => {
                state.crypto = Some(crypto);
                state.uplink_spi = uplink_spi;
            }
            None => warn!("commit_rekey with no pending crypto epoch"),
        }
    }

    /// Discard the pending rekey epoch after a failed key install; the
    /// committed epoch stays authoritative.
    pub fn abandon_rekey(&self) {
        let mut state = self.state.lock().expect("provision mutex poisoned");
        if state.pending_crypto.take().is_some() {
            warn!("Abandoned pending rekey epoch");
        }
    }

    /// Sign data with the committed epoch's rekey key.
    pub fn generate_signature(&self, data: &[u8]) -> Result<[u8; 64], Status> {
        let state = self.state.lock().expect("provision mutex poisoned");
        let crypto = state
            .crypto
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("no committed crypto epoch"))?;
        Ok(crypto.generate_signature(data))
    }

    pub fn control_plane_sockaddr(&self) -> Option<String> {
        let state = self.state.lock().expect("provision mutex poisoned");
        if state.control_plane_sockaddr.is_empty() {
            None
        } else {
            Some(state.control_plane_sockaddr.clone())
        }
    }

    pub fn apn_type(&self) -> String {
        self.state
            .lock()
            .expect("provision mutex poisoned")
            .apn_type
            .clone()
    }
}
