//! Datapath collaborator seam.
//!
//! The datapath owns packet encryption and forwarding; the engine only
//! hands it key material and endpoints and reacts to its notifications.
//! Key material crosses this seam as immutable [`TransformParams`]
//! snapshots, never as a live handle to the session crypto.

use crate::egress::EgressParams;
use crate::platform::NetworkInfo;
use crate::session::endpoint::Endpoint;
use crate::session::events::SessionEvent;
use crate::status::Status;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-GCM key material for the bridge dataplane.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BridgeTransformParams {
    pub uplink_key: Vec<u8>,
    pub downlink_key: Vec<u8>,
}

/// Key and salt material for the IPsec dataplane.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IpsecTransformParams {
    pub uplink_key: Vec<u8>,
    pub downlink_key: Vec<u8>,
    pub uplink_salt: Vec<u8>,
    pub downlink_salt: Vec<u8>,
    #[zeroize(skip)]
    pub downlink_spi: u32,
}

/// Derived transform parameters handed to the datapath.
#[derive(Clone)]
pub enum TransformParams {
    Bridge(BridgeTransformParams),
    Ipsec(IpsecTransformParams),
}

impl std::fmt::Debug for TransformParams {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformParams::Bridge(_) => write!(f, "TransformParams::Bridge(..)"),
            TransformParams::Ipsec(p) => {
                write!(f, "TransformParams::Ipsec(downlink_spi: {})", p.downlink_spi)
            }
        }
    }
}

/// Parameters of the IKE egress variant. The engine surfaces these to
/// the datapath untouched and waits for its notifications.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IkeParams {
    pub client_id: Vec<u8>,
    pub shared_secret: Vec<u8>,
    #[zeroize(skip)]
    pub server_address: String,
}

/// Opaque datapath state snapshot for debug reporting.
#[derive(Clone, Debug, Default)]
pub struct DatapathDebugInfo {
    pub state: String,
    pub uplink_packets_dropped: u64,
    pub downlink_packets_dropped: u64,
}

/// The transport datapath the engine drives.
#[async_trait]
pub trait Datapath: Send + Sync {
    /// Install the notifier the datapath reports through. Called once
    /// per session before `start`.
    fn register_notifier(&self, notifier: DatapathNotifier);

    /// Bring up the dataplane with the provisioned egress and keys.
    async fn start(
        &self,
        egress: &EgressParams,
        transform_params: &TransformParams,
    ) -> Result<(), Status>;

    /// Bring up the IKE dataplane variant.
    async fn start_ike(&self, ike: &IkeParams) -> Result<(), Status>;

    async fn stop(&self);

    /// Re-bind the dataplane to `network`, sending to `endpoint`.
    /// `counter` increases with every switch for this session.
    async fn switch_network(
        &self,
        network_id: u64,
        endpoint: &Endpoint,
        network: &NetworkInfo,
        counter: u32,
    ) -> Result<(), Status>;

    /// Quiesce before the tunnel fd is replaced.
    async fn prepare_for_tunnel_switch(&self);

    /// Resume on the replacement tunnel fd.
    async fn switch_tunnel(&self);

    /// Install rekeyed transform params. The previous keys stay active
    /// until this returns success.
    async fn set_key_materials(&self, transform_params: &TransformParams) -> Result<(), Status>;

    fn get_debug_info(&self) -> DatapathDebugInfo;
}

/// Handle the datapath uses to notify the session.
///
/// Notifications become messages on the session worker queue; the
/// datapath returns immediately. `network_id` ties establishment and
/// failure reports to the network they refer to so the session can
/// discard reports about a superseded network.
#[derive(Clone)]
pub struct DatapathNotifier {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl DatapathNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn datapath_established(&self, network_id: u64) {
        self.post(SessionEvent::DatapathEstablished { network_id });
    }

    pub fn datapath_failed(&self, network_id: u64, status: Status) {
        self.post(SessionEvent::DatapathFailed { network_id, status });
    }

    pub fn datapath_permanent_failure(&self, status: Status) {
        self.post(SessionEvent::DatapathPermanentFailure { status });
    }

    pub fn uplink_mtu_update(&self, uplink_mtu: u16, tunnel_mtu: u16) {
        self.post(SessionEvent::UplinkMtuUpdate {
            uplink_mtu,
            tunnel_mtu,
        });
    }

    pub fn downlink_mtu_update(&self, downlink_mtu: u16) {
        self.post(SessionEvent::DownlinkMtuUpdate { downlink_mtu });
    }

    pub fn do_rekey(&self) {
        self.post(SessionEvent::DoRekey);
    }

    fn post(&self, event: SessionEvent) {
        // A closed queue means the session worker already exited; the
        // notification is irrelevant by then.
        if self.tx.send(event).is_err() {
            warn!("Dropping datapath notification for stopped session");
        }
    }
}
