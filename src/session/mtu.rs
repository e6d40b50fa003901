//! MTU update flows.
//!
//! Uplink updates are local: the tunnel is rebuilt with the new tunnel
//! MTU while the datapath pauses across the fd swap. Downlink updates
//! are reported to the auth service with a signed path-info request;
//! the new value is remembered only once the server acknowledges it.

use super::{Session, SessionState};
use crate::http::HttpRequest;
use crate::session::events::SessionEvent;
use crate::status::Status;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info};

impl Session {
    pub(super) async fn handle_uplink_mtu_update(&mut self, uplink_mtu: u16, tunnel_mtu: u16) {
        if self.state != SessionState::DataPlaneConnected {
            info!(state = %self.state, "Ignoring uplink MTU update in unconnected state");
            return;
        }

        if tunnel_mtu != self.mtu.tunnel_mtu {
            info!(
                from = self.mtu.tunnel_mtu,
                to = tunnel_mtu,
                "Updating tunnel MTU"
            );
            self.mtu.tunnel_mtu = tunnel_mtu;
            self.update_tunnel(false).await;
        }
        if uplink_mtu != self.mtu.uplink_mtu {
            info!(from = self.mtu.uplink_mtu, to = uplink_mtu, "Updating uplink MTU");
            self.mtu.uplink_mtu = uplink_mtu;
        }
    }

    pub(super) fn handle_downlink_mtu_update(&mut self, downlink_mtu: u16) {
        if !matches!(
            self.state,
            SessionState::ControlPlaneConnected | SessionState::DataPlaneConnected
        ) {
            info!(state = %self.state, "Ignoring downlink MTU update in unconnected state");
            return;
        }
        if downlink_mtu == self.mtu.downlink_mtu {
            return;
        }
        if let Err(status) = self.send_update_path_info(downlink_mtu) {
            // Non-disconnecting: the tunnel keeps running on the old
            // downlink value.
            error!(%status, "Could not send path info update");
        }
    }

    /// POST the signed path-info update; the completion comes back as
    /// a session event.
    fn send_update_path_info(&mut self, downlink_mtu: u16) -> Result<(), Status> {
        let session_id = self
            .session_id
            .ok_or_else(|| Status::failed_precondition("no session id assigned yet"))?;
        let control_plane_sock_addr = self
            .provisioner
            .control_plane_sockaddr()
            .ok_or_else(|| Status::failed_precondition("control plane sockaddr not set"))?;

        // TODO: a rekey committing between signing and server-side
        // verification invalidates this signature; resend on rejection.
        let signed_data = format!(
            "path_info;{};{};{}",
            session_id, self.mtu.uplink_mtu, downlink_mtu
        );
        let signature = self.provisioner.generate_signature(signed_data.as_bytes())?;

        let body = serde_json::json!({
            "session_id": session_id,
            "uplink_mtu": self.mtu.uplink_mtu,
            "downlink_mtu": downlink_mtu,
            "mtu_update_signature": BASE64.encode(signature),
            "apn_type": self.provisioner.apn_type(),
            "control_plane_sock_addr": control_plane_sock_addr,
        });
        let request = HttpRequest::post_json(&self.config.update_path_info_url, body)
            .with_api_key(self.config.api_key.as_deref());

        let http = std::sync::Arc::clone(&self.http);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let response = http.post_json(request).await;
            let _ = events.send(SessionEvent::UpdatePathInfoResult {
                downlink_mtu,
                http_code: response.status.code,
            });
        });
        Ok(())
    }

    pub(super) fn handle_update_path_info_result(&mut self, downlink_mtu: u16, http_code: u16) {
        if (200..300).contains(&http_code) {
            info!(downlink_mtu, "Path info update acknowledged");
            self.mtu.downlink_mtu = downlink_mtu;
        } else {
            // Log-and-ignore; this never disconnects the session.
            error!(
                http_code,
                downlink_mtu, "Path info update rejected, keeping previous downlink MTU"
            );
        }
    }

    /// Rebuild the tunnel with current parameters, pausing the
    /// datapath across the fd swap.
    pub(super) async fn update_tunnel(&mut self, force: bool) {
        if !self.vpn_service.is_tunnel_active() {
            info!("No active tunnel to update");
            return;
        }

        let tun_fd_data = match self.build_tun_fd_data() {
            Ok(tun_fd_data) => tun_fd_data,
            Err(status) => {
                self.enter_session_error(status);
                return;
            }
        };

        self.datapath.prepare_for_tunnel_switch().await;
        if let Err(status) = self.vpn_service.create_tunnel(tun_fd_data.clone(), force).await {
            error!(%status, "Tunnel update failed");
            self.datapath.stop().await;
            if status.is_permanent() {
                self.set_state(SessionState::SessionError, Some(&status));
                self.notifier.permanent_failure(status);
            } else {
                self.enter_session_error(status);
            }
            return;
        }
        self.current_tunnel_ips = Some(tun_fd_data.tunnel_ip_addresses);
        self.datapath.switch_tunnel().await;
    }
}
