//! Reconnector: the outer retry loop that keeps the tunnel up.
//!
//! Wraps session lifecycle. Transient session failures schedule a
//! restart with exponential backoff; a connection deadline bounds each
//! establishment attempt; permanent failures stop the engine. Like the
//! session, the reconnector is a single worker consuming a message
//! queue — session notifications are forwarded into it by a
//! [`SessionObserver`] shim.

use crate::config::EngineConfig;
use crate::datapath::Datapath;
use crate::http::HttpTransport;
use crate::platform::{NetworkInfo, OAuthTokenProvider, VpnService};
use crate::session::notify::SessionObserver;
use crate::session::{Session, SessionHandle};
use crate::status::{Code, Status};
use crate::telemetry::Telemetry;
use crate::timer::{TimerId, TimerManager};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine-level connection status handed to the observer on every
/// disconnection.
#[derive(Clone, Debug)]
pub struct DisconnectionStatus {
    pub code: Code,
    pub message: String,
    /// Whether a tunnel is still up and blocking traffic.
    pub is_blocking_traffic: bool,
    pub has_available_networks: bool,
}

/// Observer for engine-level connectivity changes.
pub trait EngineObserver: Send + Sync {
    fn control_plane_connected(&self) {}

    /// A session establishment attempt began.
    fn connecting(&self) {}

    /// The dataplane is up; user traffic flows.
    fn connected(&self) {}

    fn waiting_to_reconnect(&self, time_to_reconnect: Duration) {
        let _ = time_to_reconnect;
    }

    fn disconnected(&self, status: &DisconnectionStatus) {
        let _ = status;
    }

    fn network_disconnected(&self, network: &NetworkInfo, status: &Status) {
        let _ = (network, status);
    }

    fn permanent_failure(&self, status: &Status) {
        let _ = status;
    }
}

/// Reconnector states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectorState {
    Initial,
    WaitingForSessionEstablishment,
    WaitingToReconnect,
    Connected,
    /// No network available; resumes on the next SetNetwork.
    Paused,
    PermanentFailure,
    Stopped,
}

impl fmt::Display for ReconnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconnectorState::Initial => "Initial",
            ReconnectorState::WaitingForSessionEstablishment => "WaitingForSessionEstablishment",
            ReconnectorState::WaitingToReconnect => "WaitingToReconnect",
            ReconnectorState::Connected => "Connected",
            ReconnectorState::Paused => "Paused",
            ReconnectorState::PermanentFailure => "PermanentFailure",
            ReconnectorState::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

enum ReconnectorEvent {
    Start,
    Stop,
    SetNetwork(Option<NetworkInfo>),
    SessionControlPlaneConnected,
    SessionControlPlaneDisconnected(Status),
    SessionPermanentFailure(Status),
    SessionDatapathConnecting,
    SessionDatapathConnected,
    SessionDatapathDisconnected(NetworkInfo, Status),
    TimerExpired(TimerId),
}

/// Forwards session notifications into the reconnector queue.
struct SessionNotificationForwarder {
    tx: mpsc::UnboundedSender<ReconnectorEvent>,
}

impl SessionObserver for SessionNotificationForwarder {
    fn control_plane_connected(&self) {
        let _ = self.tx.send(ReconnectorEvent::SessionControlPlaneConnected);
    }

    fn control_plane_disconnected(&self, status: &Status) {
        let _ = self
            .tx
            .send(ReconnectorEvent::SessionControlPlaneDisconnected(status.clone()));
    }

    fn permanent_failure(&self, status: &Status) {
        let _ = self
            .tx
            .send(ReconnectorEvent::SessionPermanentFailure(status.clone()));
    }

    fn datapath_connecting(&self) {
        let _ = self.tx.send(ReconnectorEvent::SessionDatapathConnecting);
    }

    fn datapath_connected(&self) {
        let _ = self.tx.send(ReconnectorEvent::SessionDatapathConnected);
    }

    fn datapath_disconnected(&self, network: &NetworkInfo, status: &Status) {
        let _ = self.tx.send(ReconnectorEvent::SessionDatapathDisconnected(
            network.clone(),
            status.clone(),
        ));
    }
}

/// Handle for driving a running reconnector.
#[derive(Clone)]
pub struct ReconnectorHandle {
    tx: mpsc::UnboundedSender<ReconnectorEvent>,
}

impl ReconnectorHandle {
    pub fn start(&self) {
        let _ = self.tx.send(ReconnectorEvent::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(ReconnectorEvent::Stop);
    }

    /// `None` means no network is available (airplane mode).
    pub fn set_network(&self, network: Option<NetworkInfo>) {
        let _ = self.tx.send(ReconnectorEvent::SetNetwork(network));
    }
}

/// The outer retry loop. Constructed with the engine's collaborators,
/// consumed by [`Reconnector::run`].
pub struct Reconnector {
    config: Arc<EngineConfig>,
    http: Arc<dyn HttpTransport>,
    oauth: Arc<dyn OAuthTokenProvider>,
    vpn_service: Arc<dyn VpnService>,
    datapath: Arc<dyn Datapath>,
    timer_manager: Arc<TimerManager>,
    telemetry: Arc<Telemetry>,
    observer: Arc<dyn EngineObserver>,

    events_tx: mpsc::UnboundedSender<ReconnectorEvent>,
    events_rx: mpsc::UnboundedReceiver<ReconnectorEvent>,

    state: ReconnectorState,
    session: Option<SessionHandle>,
    session_restart_counter: u32,
    successive_control_plane_failures: u32,
    successive_datapath_failures: u32,
    reconnect_timer: Option<TimerId>,
    deadline_timer: Option<TimerId>,
    active_network: Option<NetworkInfo>,
    set_network_called: bool,
}

impl Reconnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        http: Arc<dyn HttpTransport>,
        oauth: Arc<dyn OAuthTokenProvider>,
        vpn_service: Arc<dyn VpnService>,
        datapath: Arc<dyn Datapath>,
        timer_manager: Arc<TimerManager>,
        telemetry: Arc<Telemetry>,
        observer: Arc<dyn EngineObserver>,
    ) -> (Self, ReconnectorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reconnector = Self {
            config,
            http,
            oauth,
            vpn_service,
            datapath,
            timer_manager,
            telemetry,
            observer,
            events_tx: events_tx.clone(),
            events_rx,
            state: ReconnectorState::Initial,
            session: None,
            session_restart_counter: 0,
            successive_control_plane_failures: 0,
            successive_datapath_failures: 0,
            reconnect_timer: None,
            deadline_timer: None,
            active_network: None,
            set_network_called: false,
        };
        (reconnector, ReconnectorHandle { tx: events_tx })
    }

    /// Run the reconnector worker until `Stop`.
    pub async fn run(mut self) {
        info!("Reconnector worker started");
        while let Some(event) = self.events_rx.recv().await {
            let stopping = matches!(event, ReconnectorEvent::Stop);
            self.handle_event(event);
            if stopping {
                break;
            }
        }
        info!("Reconnector worker stopped");
    }

    fn handle_event(&mut self, event: ReconnectorEvent) {
        match event {
            ReconnectorEvent::Start => self.handle_start(),
            ReconnectorEvent::Stop => self.handle_stop(),
            ReconnectorEvent::SetNetwork(network) => self.handle_set_network(network),
            ReconnectorEvent::SessionControlPlaneConnected => self.handle_control_plane_connected(),
            ReconnectorEvent::SessionControlPlaneDisconnected(status) => {
                self.handle_control_plane_disconnected(status)
            }
            ReconnectorEvent::SessionPermanentFailure(status) => {
                self.handle_permanent_failure(status)
            }
            ReconnectorEvent::SessionDatapathConnecting => {
                debug!("Session datapath connecting");
            }
            ReconnectorEvent::SessionDatapathConnected => self.handle_datapath_connected(),
            ReconnectorEvent::SessionDatapathDisconnected(network, status) => {
                self.handle_datapath_disconnected(network, status)
            }
            ReconnectorEvent::TimerExpired(id) => self.handle_timer_expired(id),
        }
    }

    fn handle_start(&mut self) {
        if self.state != ReconnectorState::Initial {
            warn!(state = %self.state, "Ignoring Start in non-initial state");
            return;
        }
        self.establish_session();
    }

    fn handle_stop(&mut self) {
        info!("Stopping reconnector");
        self.cancel_all_timers();
        if let Some(session) = self.session.take() {
            session.stop(false);
        }
        self.set_state(ReconnectorState::Stopped);
    }

    fn establish_session(&mut self) {
        self.session_restart_counter += 1;
        self.telemetry.incr_session_restarts();
        info!(
            restart = self.session_restart_counter,
            "Establishing session"
        );

        let forwarder = Arc::new(SessionNotificationForwarder {
            tx: self.events_tx.clone(),
        });
        let (session, handle) = Session::new(
            Arc::clone(&self.config),
            Arc::clone(&self.http),
            Arc::clone(&self.oauth),
            Arc::clone(&self.vpn_service),
            Arc::clone(&self.datapath),
            Arc::clone(&self.timer_manager),
            Arc::clone(&self.telemetry),
            forwarder,
            self.active_network.clone(),
        );
        tokio::spawn(session.run());
        handle.start();
        self.session = Some(handle);

        self.start_deadline_timer();
        self.set_state(ReconnectorState::WaitingForSessionEstablishment);
        self.observer.connecting();
    }

    /// Stop the current session and tell the observer why.
    fn terminate_session(&mut self, reason: Status) {
        if let Some(session) = self.session.take() {
            session.stop(false);
        }
        let status = self.disconnection_status(&reason);
        self.observer.disconnected(&status);
    }

    fn start_reconnection(&mut self) {
        self.terminate_session(Status::deadline_exceeded("waiting to reconnect"));
        let delay = self.reconnect_duration();
        info!(delay_msec = delay.as_millis() as u64, "Scheduling session restart");
        self.cancel_reconnect_timer();
        self.reconnect_timer = Some(self.start_expiry_timer(delay));
        self.set_state(ReconnectorState::WaitingToReconnect);
        self.observer.waiting_to_reconnect(delay);
    }

    fn handle_control_plane_connected(&mut self) {
        info!("Session control plane connected");
        // The deadline may have fired in the same instant; if so a
        // fresh establishment is already scheduled and this event
        // belongs to the torn-down session.
        if self.deadline_timer.is_none() && self.state != ReconnectorState::Connected {
            info!("Control plane connected after the deadline fired, ignoring");
            return;
        }
        self.successive_control_plane_failures = 0;
        self.cancel_deadline_timer();
        self.set_state(ReconnectorState::Connected);
        self.observer.control_plane_connected();
    }

    fn handle_control_plane_disconnected(&mut self, status: Status) {
        info!(%status, "Session control plane disconnected");
        if self.deadline_timer.is_none() && self.state != ReconnectorState::Connected {
            info!("Disconnect in a non-waiting state or after deadline expiry, ignoring");
            return;
        }
        self.cancel_deadline_timer();
        let disconnection = self.disconnection_status(&status);
        self.observer.disconnected(&disconnection);
        self.successive_control_plane_failures += 1;
        self.telemetry.incr_control_plane_failures();
        self.start_reconnection();
    }

    fn handle_permanent_failure(&mut self, status: Status) {
        warn!(%status, "Session has a permanent failure");
        self.cancel_all_timers();
        if let Some(session) = self.session.take() {
            session.stop(false);
        }
        self.set_state(ReconnectorState::PermanentFailure);
        self.observer.permanent_failure(&status);
    }

    fn handle_datapath_connected(&mut self) {
        info!("Session datapath connected");
        // The session is considered successful; backoff state resets.
        self.successive_control_plane_failures = 0;
        self.successive_datapath_failures = 0;
        self.observer.connected();
    }

    fn handle_datapath_disconnected(&mut self, network: NetworkInfo, status: Status) {
        info!(%status, network_id = network.network_id, "Session datapath disconnected");
        self.observer.network_disconnected(&network, &status);
        let disconnection = self.disconnection_status(&status);
        self.observer.disconnected(&disconnection);
        self.successive_datapath_failures += 1;
        self.telemetry.incr_data_plane_failures();

        if self.state == ReconnectorState::Connected {
            self.start_reconnection();
        }
    }

    fn handle_set_network(&mut self, network: Option<NetworkInfo>) {
        self.set_network_called = true;
        self.active_network = network.clone();
        // A fresh network resets the failure history.
        self.successive_control_plane_failures = 0;
        self.successive_datapath_failures = 0;

        match network {
            None => {
                info!("No network available, pausing");
                if self.session.is_some() {
                    self.terminate_session(Status::internal("no network available"));
                }
                self.cancel_all_timers();
                self.set_state(ReconnectorState::Paused);
            }
            Some(network) => {
                if self.state == ReconnectorState::Paused {
                    info!("Network available again, unpausing");
                    self.start_reconnection();
                    return;
                }
                if let Some(session) = &self.session {
                    session.set_network(Some(network));
                }
            }
        }
    }

    fn handle_timer_expired(&mut self, id: TimerId) {
        if take_matching(&mut self.reconnect_timer, id) {
            self.handle_reconnect_timer_expired();
        } else if take_matching(&mut self.deadline_timer, id) {
            self.handle_deadline_timer_expired();
        } else {
            debug!(timer_id = %id, "Expiry for a timer that is no longer registered");
        }
    }

    fn handle_reconnect_timer_expired(&mut self) {
        info!("Reconnect timer expired");
        if self.state != ReconnectorState::WaitingToReconnect {
            warn!(state = %self.state, "Reconnect timer expired in unexpected state");
            return;
        }
        self.establish_session();
    }

    fn handle_deadline_timer_expired(&mut self) {
        info!("Session connection deadline expired");
        if self.state != ReconnectorState::WaitingForSessionEstablishment {
            warn!(state = %self.state, "Deadline expired in unexpected state");
            return;
        }
        self.successive_control_plane_failures += 1;
        self.telemetry.incr_control_plane_failures();
        self.start_reconnection();
    }

    /// Backoff for the next restart: the configured initial delay,
    /// doubled per consecutive failure, capped by the connection
    /// deadline.
    fn reconnect_duration(&self) -> Duration {
        let attempts = self
            .successive_control_plane_failures
            .max(self.successive_datapath_failures);
        Duration::from_millis(backoff_msec(
            self.config.initial_time_to_reconnect_msec,
            attempts,
            self.config.session_connection_deadline_msec,
        ))
    }

    fn disconnection_status(&self, reason: &Status) -> DisconnectionStatus {
        DisconnectionStatus {
            code: reason.code(),
            message: reason.message().to_string(),
            is_blocking_traffic: self.vpn_service.is_tunnel_active(),
            has_available_networks: self.set_network_called && self.active_network.is_some(),
        }
    }

    fn set_state(&mut self, state: ReconnectorState) {
        info!(from = %self.state, to = %state, "Reconnector state transition");
        self.state = state;
    }

    fn start_deadline_timer(&mut self) {
        self.cancel_deadline_timer();
        self.deadline_timer =
            Some(self.start_expiry_timer(self.config.session_connection_deadline()));
    }

    fn start_expiry_timer(&self, duration: Duration) -> TimerId {
        let tx = self.events_tx.clone();
        self.timer_manager.start_timer(duration, move |id| {
            let _ = tx.send(ReconnectorEvent::TimerExpired(id));
        })
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(id) = self.reconnect_timer.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_deadline_timer(&mut self) {
        if let Some(id) = self.deadline_timer.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_reconnect_timer();
        self.cancel_deadline_timer();
    }
}

/// Exponential backoff: `initial * 2^(attempts-1)`, capped.
fn backoff_msec(initial_msec: u64, attempts: u32, cap_msec: u64) -> u64 {
    let shift = attempts.saturating_sub(1);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    initial_msec.saturating_mul(multiplier).min(cap_msec)
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
