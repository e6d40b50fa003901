//! Network switch and datapath connection handling.

use super::{Session, SessionState, MAX_DATAPATH_REATTEMPTS};
use crate::platform::NetworkInfo;
use crate::status::Status;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl Session {
    pub(super) async fn handle_set_network(&mut self, network: Option<NetworkInfo>) {
        match network {
            Some(network) => self.switch_to_network(network).await,
            None => self.clear_network().await,
        }
    }

    async fn switch_to_network(&mut self, network: NetworkInfo) {
        if self.active_network.is_some() && self.state.is_connected() {
            info!(
                network_id = network.network_id,
                network_type = ?network.network_type,
                "Switching network"
            );
            self.switching_network = true;
            self.network_switch_start = Some(Instant::now());
            self.telemetry.incr_network_switches();
        } else {
            info!(
                network_id = network.network_id,
                network_type = ?network.network_type,
                "Setting network"
            );
        }

        self.telemetry.set_debug_network(Some(network.network_id));
        self.active_network = Some(network);
        self.reset_datapath_reattempts();

        if !self.state.is_connected() {
            info!(state = %self.state, "Session not connected yet, caching active network");
            return;
        }
        self.connect_datapath().await;
    }

    /// No network is available. The datapath is torn down and nothing
    /// is reattempted until a new network arrives.
    async fn clear_network(&mut self) {
        info!("Active network cleared");
        self.telemetry.set_debug_network(None);
        self.active_network = None;
        self.cancel_connecting_timer();
        self.cancel_reattempt_timer();
        self.datapath_reattempt_count = 0;
        self.switching_network = false;

        if matches!(
            self.state,
            SessionState::DataPlaneConnecting | SessionState::DataPlaneConnected
        ) {
            self.datapath.stop().await;
            self.set_state(SessionState::ControlPlaneConnected, None);
        }
    }

    /// Drive the datapath onto the active network: tunnel, endpoint,
    /// switch. Entered from SetNetwork, reattempt expiry, and initial
    /// datapath start.
    pub(super) async fn connect_datapath(&mut self) {
        let Some(network) = self.active_network.clone() else {
            error!("connect_datapath without an active network");
            return;
        };
        info!(
            network_id = network.network_id,
            reattempt = self.datapath_reattempt_count,
            "Connecting datapath"
        );

        self.notifier.datapath_connecting();

        if let Err(status) = self.create_tunnel_if_needed().await {
            error!(%status, "Tunnel creation failed");
            if status.is_permanent() {
                self.set_state(SessionState::SessionError, Some(&status));
                self.notifier.permanent_failure(status);
            } else {
                self.enter_session_error(status);
            }
            return;
        }

        let endpoint = match self.endpoint_selector.next_endpoint() {
            Ok(endpoint) => endpoint,
            Err(status) => {
                self.enter_session_error(status);
                return;
            }
        };

        if self.config.datapath_connecting_timer_enabled {
            self.start_connecting_timer();
        }

        self.switch_network_counter += 1;
        self.set_state(SessionState::DataPlaneConnecting, None);
        let result = self
            .datapath
            .switch_network(
                network.network_id,
                &endpoint,
                &network,
                self.switch_network_counter,
            )
            .await;
        if let Err(status) = result {
            error!(%status, endpoint = %endpoint, "Switching networks failed");
            self.notify_datapath_disconnected(network, status).await;
        }
    }

    /// Create the tunnel unless the active one already carries the
    /// same tunnel IPs.
    async fn create_tunnel_if_needed(&mut self) -> Result<(), Status> {
        let tun_fd_data = self.build_tun_fd_data()?;
        if self.vpn_service.is_tunnel_active()
            && self.current_tunnel_ips.as_deref() == Some(tun_fd_data.tunnel_ips())
        {
            debug!("Reusing active tunnel, tunnel IPs unchanged");
            return Ok(());
        }

        self.vpn_service.create_tunnel(tun_fd_data.clone(), false).await?;
        self.current_tunnel_ips = Some(tun_fd_data.tunnel_ip_addresses);
        Ok(())
    }

    pub(super) fn handle_datapath_established(&mut self, network_id: u64) {
        match &self.active_network {
            Some(network) if network.network_id == network_id => {}
            _ => {
                warn!(network_id, "Discarding establishment for a superseded network");
                return;
            }
        }
        if !matches!(
            self.state,
            SessionState::DataPlaneConnecting | SessionState::DataPlaneConnected
        ) {
            warn!(state = %self.state, "Ignoring DatapathEstablished in unexpected state");
            return;
        }

        info!(network_id, "Datapath established");
        self.cancel_connecting_timer();
        // The reattempt count resets, but the selector keeps tracking
        // the established endpoint so a later failure starts its
        // reattempts from the opposite family.
        self.cancel_reattempt_timer();
        self.datapath_reattempt_count = 0;

        if self.switching_network {
            self.telemetry.incr_successful_network_switches();
            if let Some(start) = self.network_switch_start.take() {
                self.telemetry.record_network_switch_latency(start.elapsed());
            }
            self.switching_network = false;
        }

        self.set_state(SessionState::DataPlaneConnected, None);
        self.notifier.datapath_connected();
    }

    pub(super) async fn handle_datapath_failed(&mut self, network_id: u64, status: Status) {
        match &self.active_network {
            Some(network) if network.network_id == network_id => {}
            _ => {
                warn!(network_id, "Discarding failure for a superseded network");
                return;
            }
        }
        self.cancel_connecting_timer();
        self.handle_datapath_failure(status).await;
    }

    /// Common failure path for datapath failures and connecting
    /// timeouts: reattempt while attempts remain, otherwise report the
    /// datapath as disconnected.
    pub(super) async fn handle_datapath_failure(&mut self, status: Status) {
        let Some(network) = self.active_network.clone() else {
            // The active network never goes from set to unset while
            // connected except through SetNetwork(None), which already
            // tore the datapath down.
            info!("Datapath failure after network was cleared, ignoring");
            return;
        };

        error!(%status, "Datapath failed");
        self.latest_datapath_status = Some(status.clone());

        if self.state.is_connected() && self.datapath_reattempt_count < MAX_DATAPATH_REATTEMPTS {
            self.datapath_reattempt_count += 1;
            info!(
                reattempt = self.datapath_reattempt_count,
                "Scheduling datapath reattempt"
            );
            self.set_state(SessionState::DataPlaneConnecting, Some(&status));
            self.start_reattempt_timer();
            return;
        }

        error!("Not reattempting datapath connection, attempts exhausted");
        self.notify_datapath_disconnected(network, status).await;
    }

    /// Reattempt timer expiry.
    pub(super) async fn attempt_datapath_reconnect(&mut self) {
        info!("Datapath reattempt timer expired");

        // The datapath may have come up while the timer ran; its
        // network binding was never withdrawn.
        if self.state == SessionState::DataPlaneConnected {
            info!("Datapath already connected, not reattempting");
            return;
        }
        if self.active_network.is_none() {
            let status = self
                .latest_datapath_status
                .clone()
                .unwrap_or_else(|| Status::internal("datapath failed with no recorded status"));
            let network = NetworkInfo::new(0, Default::default());
            self.notify_datapath_disconnected(network, status).await;
            return;
        }
        self.connect_datapath().await;
    }

    /// Datapath-connecting watchdog expiry: one reattempt is scheduled
    /// through the common failure path.
    pub(super) async fn handle_connecting_timeout(&mut self) {
        info!("Datapath connecting timer expired");
        self.datapath.stop().await;
        self.handle_datapath_failure(Status::deadline_exceeded(
            "timed out waiting for datapath establishment",
        ))
        .await;
    }

    pub(super) async fn handle_datapath_permanent_failure(&mut self, status: Status) {
        error!(%status, "Datapath reported a permanent failure");
        // A permanent datapath failure ends this session; the outer
        // reconnector replaces it with a fresh one.
        let network = self
            .active_network
            .clone()
            .unwrap_or_else(|| NetworkInfo::new(0, Default::default()));
        self.notify_datapath_disconnected(network, status).await;
    }

    pub(super) async fn notify_datapath_disconnected(
        &mut self,
        network: NetworkInfo,
        status: Status,
    ) {
        error!(%status, "Datapath disconnected");
        self.cancel_connecting_timer();
        self.datapath.stop().await;
        self.latest_datapath_status = Some(status.clone());
        self.notifier.datapath_disconnected(network, status);
    }

    pub(super) fn reset_datapath_reattempts(&mut self) {
        self.cancel_reattempt_timer();
        self.datapath_reattempt_count = 0;
        let endpoints = self
            .egress_params
            .as_ref()
            .map(|e| e.egress_endpoints.clone())
            .unwrap_or_default();
        debug!(
            endpoints = endpoints.len(),
            has_network = self.active_network.is_some(),
            "Resetting datapath reattempt state"
        );
        self.endpoint_selector.reset(
            &endpoints,
            self.active_network.as_ref(),
            self.config.ipv6_enabled,
        );
    }
}
