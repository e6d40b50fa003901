//! Session state machine.
//!
//! A session is one provisioned tunnel epoch: it drives Auth → Egress
//! through the provisioner, hands the resulting keys and endpoints to
//! the datapath, and then reacts to network switches, datapath
//! notifications, MTU updates, timer expiries, and rekeys until it is
//! stopped.
//!
//! All inputs arrive as [`SessionEvent`] messages on one queue and are
//! processed in order by a single worker ([`Session::run`]). State is
//! mutated nowhere else; callers off-worker only touch the telemetry
//! mutex. The worker exits after `Stop`, so late completions cannot
//! mutate state.

pub mod endpoint;
pub mod events;
pub mod notify;

mod mtu;
mod network;
mod rekey;
#[cfg(test)]
pub(crate) mod tests;

use crate::config::EngineConfig;
use crate::datapath::{Datapath, TransformParams};
use crate::egress::{EgressParams, ProvisionedDataplane};
use crate::http::HttpTransport;
use crate::platform::{
    AddressFamily, NetworkInfo, OAuthTokenProvider, TunFdData, TunnelIpRange, VpnService,
};
use crate::provision::Provisioner;
use crate::session::endpoint::EndpointSelector;
use crate::session::events::SessionEvent;
use crate::session::notify::{Notifier, SessionObserver};
use crate::status::Status;
use crate::telemetry::Telemetry;
use crate::timer::{TimerId, TimerManager};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Datapath reattempts per failure episode, excluding the first attempt.
pub const MAX_DATAPATH_REATTEMPTS: u32 = 4;

/// Delay between datapath reattempts.
const DATAPATH_REATTEMPT_DELAY: Duration = Duration::from_millis(500);

/// Tunnel MTU before the datapath reports a measured one: the common
/// 1500 minus encapsulation overhead.
const DEFAULT_TUNNEL_MTU: u16 = 1395;

/// Tunnel-scoped DNS resolvers pushed into the tunnel fd.
const TUNNEL_DNS_V4: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
const TUNNEL_DNS_V6: [&str; 2] = ["2001:4860:4860::8888", "2001:4860:4860::8844"];

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    EgressSessionCreated,
    ControlPlaneConnected,
    DataPlaneConnecting,
    DataPlaneConnected,
    SessionError,
    Stopped,
}

impl SessionState {
    /// States in which the session has a negotiated control plane and
    /// reacts to network and rekey inputs.
    fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::ControlPlaneConnected
                | SessionState::DataPlaneConnecting
                | SessionState::DataPlaneConnected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initialized => "Initialized",
            SessionState::EgressSessionCreated => "EgressSessionCreated",
            SessionState::ControlPlaneConnected => "ControlPlaneConnected",
            SessionState::DataPlaneConnecting => "DataPlaneConnecting",
            SessionState::DataPlaneConnected => "DataPlaneConnected",
            SessionState::SessionError => "SessionError",
            SessionState::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

/// Uplink, tunnel, and downlink MTU as last reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MtuState {
    pub uplink_mtu: u16,
    pub tunnel_mtu: u16,
    pub downlink_mtu: u16,
}

impl Default for MtuState {
    fn default() -> Self {
        // Uplink and downlink start at zero so the first report always
        // registers as a change.
        Self {
            uplink_mtu: 0,
            tunnel_mtu: DEFAULT_TUNNEL_MTU,
            downlink_mtu: 0,
        }
    }
}

/// Handle for posting inputs into a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn start(&self) {
        self.post(SessionEvent::Start);
    }

    pub fn stop(&self, force_fail_open: bool) {
        self.post(SessionEvent::Stop { force_fail_open });
    }

    pub fn set_network(&self, network: Option<NetworkInfo>) {
        self.post(SessionEvent::SetNetwork(network));
    }

    pub fn do_rekey(&self) {
        self.post(SessionEvent::DoRekey);
    }

    pub fn force_tunnel_update(&self) {
        self.post(SessionEvent::ForceTunnelUpdate);
    }

    /// Notifier handle to register with the datapath collaborator.
    pub fn datapath_notifier(&self) -> crate::datapath::DatapathNotifier {
        crate::datapath::DatapathNotifier::new(self.tx.clone())
    }

    fn post(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session worker already stopped, dropping input");
        }
    }
}

/// The session state machine. Constructed with its collaborators, then
/// consumed by [`Session::run`] on a worker task.
pub struct Session {
    config: Arc<EngineConfig>,
    http: Arc<dyn HttpTransport>,
    vpn_service: Arc<dyn VpnService>,
    datapath: Arc<dyn Datapath>,
    timer_manager: Arc<TimerManager>,
    telemetry: Arc<Telemetry>,
    provisioner: Arc<Provisioner>,
    notifier: Notifier,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,

    state: SessionState,
    latest_datapath_status: Option<Status>,

    /// Provisioned dataplane parameters; replaced atomically on rekey.
    egress_params: Option<EgressParams>,
    /// Uplink SPI of the first egress; immutable for the session life.
    session_id: Option<u32>,
    ike_session: bool,

    active_network: Option<NetworkInfo>,
    endpoint_selector: EndpointSelector,
    /// Tunnel IPs the current tunnel was created with, for reuse
    /// decisions on network switches.
    current_tunnel_ips: Option<Vec<TunnelIpRange>>,

    datapath_reattempt_count: u32,
    switch_network_counter: u32,
    switching_network: bool,
    network_switch_start: Option<Instant>,

    mtu: MtuState,

    rekey_timer: Option<TimerId>,
    reattempt_timer: Option<TimerId>,
    connecting_timer: Option<TimerId>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        http: Arc<dyn HttpTransport>,
        oauth: Arc<dyn OAuthTokenProvider>,
        vpn_service: Arc<dyn VpnService>,
        datapath: Arc<dyn Datapath>,
        timer_manager: Arc<TimerManager>,
        telemetry: Arc<Telemetry>,
        observer: Arc<dyn SessionObserver>,
        network: Option<NetworkInfo>,
    ) -> (Self, SessionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&config),
            Arc::clone(&http),
            oauth,
            Arc::clone(&telemetry),
            events_tx.clone(),
        ));
        telemetry.set_debug_network(network.as_ref().map(|n| n.network_id));
        datapath.register_notifier(crate::datapath::DatapathNotifier::new(events_tx.clone()));

        let session = Self {
            config,
            http,
            vpn_service,
            datapath,
            timer_manager,
            telemetry,
            provisioner,
            notifier: Notifier::spawn(observer),
            events_tx: events_tx.clone(),
            events_rx,
            state: SessionState::Initialized,
            latest_datapath_status: None,
            egress_params: None,
            session_id: None,
            ike_session: false,
            active_network: network,
            endpoint_selector: EndpointSelector::new(),
            current_tunnel_ips: None,
            datapath_reattempt_count: 0,
            switch_network_counter: 0,
            switching_network: false,
            network_switch_start: None,
            mtu: MtuState::default(),
            rekey_timer: None,
            reattempt_timer: None,
            connecting_timer: None,
        };
        (session, SessionHandle { tx: events_tx })
    }

    /// Run the session worker until `Stop`.
    pub async fn run(mut self) {
        info!("Session worker started");
        while let Some(event) = self.events_rx.recv().await {
            let stopping = matches!(event, SessionEvent::Stop { .. });
            self.handle_event(event).await;
            if stopping {
                break;
            }
        }
        info!("Session worker stopped");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        debug!(event = event.name(), state = %self.state, "Processing session event");
        match event {
            SessionEvent::Start => self.handle_start(),
            SessionEvent::Stop { force_fail_open } => self.handle_stop(force_fail_open).await,
            SessionEvent::SetNetwork(network) => self.handle_set_network(network).await,
            SessionEvent::DatapathEstablished { network_id } => {
                self.handle_datapath_established(network_id)
            }
            SessionEvent::DatapathFailed { network_id, status } => {
                self.handle_datapath_failed(network_id, status).await
            }
            SessionEvent::DatapathPermanentFailure { status } => {
                self.handle_datapath_permanent_failure(status).await
            }
            SessionEvent::Provisioned {
                dataplane,
                transform_params,
                is_rekey,
            } => {
                self.handle_provisioned(*dataplane, transform_params, is_rekey)
                    .await
            }
            SessionEvent::ProvisioningFailure { status, permanent } => {
                self.handle_provisioning_failure(status, permanent)
            }
            SessionEvent::DoRekey => self.handle_do_rekey(),
            SessionEvent::UplinkMtuUpdate {
                uplink_mtu,
                tunnel_mtu,
            } => self.handle_uplink_mtu_update(uplink_mtu, tunnel_mtu).await,
            SessionEvent::DownlinkMtuUpdate { downlink_mtu } => {
                self.handle_downlink_mtu_update(downlink_mtu)
            }
            SessionEvent::UpdatePathInfoResult {
                downlink_mtu,
                http_code,
            } => self.handle_update_path_info_result(downlink_mtu, http_code),
            SessionEvent::ForceTunnelUpdate => self.update_tunnel(true).await,
            SessionEvent::TimerExpired(id) => self.handle_timer_expired(id).await,
        }
    }

    fn handle_start(&mut self) {
        if self.state != SessionState::Initialized {
            warn!(state = %self.state, "Ignoring Start in non-initial state");
            return;
        }
        if let Err(status) = self.provisioner.start(false) {
            self.enter_session_error(status);
            return;
        }
        self.start_rekey_timer();
    }

    async fn handle_stop(&mut self, force_fail_open: bool) {
        info!(force_fail_open, "Stopping session");
        self.cancel_rekey_timer();
        self.cancel_reattempt_timer();
        self.cancel_connecting_timer();
        self.provisioner.stop();
        self.datapath.stop().await;
        self.vpn_service.close_tunnel(force_fail_open).await;
        self.set_state(SessionState::Stopped, None);
    }

    async fn handle_provisioned(
        &mut self,
        dataplane: ProvisionedDataplane,
        transform_params: Option<TransformParams>,
        is_rekey: bool,
    ) {
        if is_rekey {
            self.handle_rekey_provisioned(dataplane, transform_params)
                .await;
            return;
        }

        match dataplane {
            ProvisionedDataplane::Ppn(egress) => {
                info!(
                    uplink_spi = egress.uplink_spi,
                    endpoints = egress.egress_endpoints.len(),
                    "Egress session created"
                );
                if self.session_id.is_none() {
                    self.session_id = Some(egress.uplink_spi);
                }
                self.egress_params = Some(egress);
                self.set_state(SessionState::EgressSessionCreated, None);
                self.reset_datapath_reattempts();
                self.start_datapath(transform_params).await;
            }
            ProvisionedDataplane::Ike(ike) => {
                info!(server = %ike.server_address, "Egress provisioned the IKE variant");
                self.ike_session = true;
                match self.datapath.start_ike(&ike).await {
                    Ok(()) => {
                        self.set_state(SessionState::ControlPlaneConnected, None);
                        self.notifier.control_plane_connected();
                        // Nothing further until the datapath reports in.
                    }
                    Err(status) => self.fail_datapath_start(status),
                }
            }
        }
    }

    async fn start_datapath(&mut self, transform_params: Option<TransformParams>) {
        let Some(egress) = self.egress_params.clone() else {
            self.enter_session_error(Status::failed_precondition(
                "egress parameters are not initialized",
            ));
            return;
        };
        let Some(transform_params) = transform_params else {
            self.enter_session_error(Status::failed_precondition(
                "transform parameters are not initialized",
            ));
            return;
        };

        if let Err(status) = self.datapath.start(&egress, &transform_params).await {
            error!(%status, "Datapath initialization failed");
            self.fail_datapath_start(status);
            return;
        }

        // Datapath initialization counts as control plane connected;
        // failures from here on arrive as datapath notifications.
        self.set_state(SessionState::ControlPlaneConnected, None);
        self.notifier.control_plane_connected();

        if self.active_network.is_some() {
            info!("Active network available, connecting datapath");
            self.connect_datapath().await;
        } else {
            info!("No active network, waiting for SetNetwork");
        }
    }

    fn fail_datapath_start(&mut self, status: Status) {
        if status.is_permanent() {
            self.set_state(SessionState::SessionError, Some(&status));
            self.notifier.permanent_failure(status);
        } else {
            self.enter_session_error(status);
        }
    }

    fn handle_provisioning_failure(&mut self, status: Status, permanent: bool) {
        if permanent {
            self.set_state(SessionState::SessionError, Some(&status));
            self.notifier.permanent_failure(status);
        } else {
            self.enter_session_error(status);
        }
    }

    async fn handle_timer_expired(&mut self, id: TimerId) {
        if take_matching(&mut self.rekey_timer, id) {
            self.handle_rekey_timer_expiry();
        } else if take_matching(&mut self.reattempt_timer, id) {
            self.attempt_datapath_reconnect().await;
        } else if take_matching(&mut self.connecting_timer, id) {
            self.handle_connecting_timeout().await;
        } else {
            debug!(timer_id = %id, "Expiry for a timer that is no longer registered");
        }
    }

    /// Record a state transition and mirror it into the debug snapshot.
    fn set_state(&mut self, state: SessionState, status: Option<&Status>) {
        info!(from = %self.state, to = %state, "Session state transition");
        self.state = state;
        self.telemetry.set_debug_state(
            state.to_string(),
            status.map(|s| s.to_string()).unwrap_or_default(),
        );
    }

    /// Transition to `SessionError` and tell the observer the control
    /// plane is gone.
    fn enter_session_error(&mut self, status: Status) {
        self.set_state(SessionState::SessionError, Some(&status));
        self.notifier.control_plane_disconnected(status);
    }

    fn start_rekey_timer(&mut self) {
        self.cancel_rekey_timer();
        self.rekey_timer = Some(self.start_expiry_timer(self.config.rekey_duration()));
    }

    fn start_reattempt_timer(&mut self) {
        self.cancel_reattempt_timer();
        self.reattempt_timer = Some(self.start_expiry_timer(DATAPATH_REATTEMPT_DELAY));
    }

    fn start_connecting_timer(&mut self) {
        self.cancel_connecting_timer();
        self.connecting_timer =
            Some(self.start_expiry_timer(self.config.datapath_connecting_timer_duration()));
    }

    fn start_expiry_timer(&self, duration: Duration) -> TimerId {
        let tx = self.events_tx.clone();
        self.timer_manager.start_timer(duration, move |id| {
            let _ = tx.send(SessionEvent::TimerExpired(id));
        })
    }

    fn cancel_rekey_timer(&mut self) {
        if let Some(id) = self.rekey_timer.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_reattempt_timer(&mut self) {
        if let Some(id) = self.reattempt_timer.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_connecting_timer(&mut self) {
        if let Some(id) = self.connecting_timer.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    /// Build the tunnel fd parameters from the provisioned user ranges.
    fn build_tun_fd_data(&self) -> Result<TunFdData, Status> {
        let egress = self
            .egress_params
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("egress parameters are not initialized"))?;

        let mut tunnel_ip_addresses = Vec::new();
        if let Some(range) = &egress.user_private_ipv4 {
            tunnel_ip_addresses.push(parse_ip_range(range, AddressFamily::V4)?);
        }
        if let Some(range) = &egress.user_private_ipv6 {
            tunnel_ip_addresses.push(parse_ip_range(range, AddressFamily::V6)?);
        }
        if tunnel_ip_addresses.is_empty() {
            return Err(Status::invalid_argument(
                "egress response carried no user private IP ranges",
            ));
        }

        let mut tunnel_dns_addresses = Vec::new();
        for resolver in TUNNEL_DNS_V4 {
            tunnel_dns_addresses.push(TunnelIpRange::v4(resolver, 32));
        }
        for resolver in TUNNEL_DNS_V6 {
            tunnel_dns_addresses.push(TunnelIpRange::v6(resolver, 128));
        }

        Ok(TunFdData {
            mtu: self.config.dynamic_mtu_enabled.then_some(self.mtu.tunnel_mtu),
            is_metered: false,
            tunnel_ip_addresses,
            tunnel_dns_addresses,
        })
    }
}

/// Split a CIDR string into a tunnel range.
fn parse_ip_range(range: &str, family: AddressFamily) -> Result<TunnelIpRange, Status> {
    let (address, prefix) = match range.split_once('/') {
        Some((address, prefix)) => {
            let prefix: u8 = prefix.parse().map_err(|_| {
                Status::invalid_argument(format!("bad prefix in ip range: {}", range))
            })?;
            (address, Some(prefix))
        }
        None => (range, None),
    };
    if address.parse::<std::net::IpAddr>().is_err() {
        return Err(Status::invalid_argument(format!(
            "bad address in ip range: {}",
            range
        )));
    }
    Ok(TunnelIpRange {
        family,
        address: address.to_string(),
        prefix,
    })
}

/// Clear `slot` and return true when it holds exactly `id`.
fn take_matching(slot: &mut Option<TimerId>, id: TimerId) -> bool {
    if *slot == Some(id) {
        *slot = None;
        true
    } else {
        false
    }
}
