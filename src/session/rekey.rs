//! Rekey handling.
//!
//! A rekey runs the full Auth → Egress pipeline with a fresh crypto
//! epoch whose public value is signed by the previous one. The old
//! keys and egress parameters stay active until the datapath confirms
//! the new keys are installed; only then does the swap commit.

use super::Session;
use crate::datapath::TransformParams;
use crate::egress::ProvisionedDataplane;
use crate::status::Status;
use tracing::{info, warn};

impl Session {
    pub(super) fn handle_do_rekey(&mut self) {
        self.rekey();
    }

    pub(super) fn handle_rekey_timer_expiry(&mut self) {
        info!("Rekey timer expired");
        self.rekey();
    }

    fn rekey(&mut self) {
        if !self.state.is_connected() {
            // The timer is armed at session start, so an expiry can
            // land before the session ever connects.
            warn!(state = %self.state, "Ignoring rekey in unconnected state");
            return;
        }
        if self.ike_session {
            warn!("Rekey is handled by the datapath for IKE sessions");
            return;
        }
        info!("Starting rekey");
        if let Err(status) = self.provisioner.start(true) {
            warn!(%status, "Rekey provisioning not started");
        }
    }

    pub(super) async fn handle_rekey_provisioned(
        &mut self,
        dataplane: ProvisionedDataplane,
        transform_params: Option<TransformParams>,
    ) {
        let ProvisionedDataplane::Ppn(egress) = dataplane else {
            self.provisioner.abandon_rekey();
            self.enter_session_error(Status::invalid_argument(
                "rekey response switched the dataplane variant",
            ));
            return;
        };
        let Some(transform_params) = transform_params else {
            self.provisioner.abandon_rekey();
            self.enter_session_error(Status::failed_precondition(
                "rekey produced no transform parameters",
            ));
            return;
        };

        info!(uplink_spi = egress.uplink_spi, "Installing rekeyed key material");
        if let Err(status) = self.datapath.set_key_materials(&transform_params).await {
            // The datapath kept the previous keys; the previous egress
            // parameters stay authoritative.
            self.provisioner.abandon_rekey();
            self.enter_session_error(status);
            return;
        }

        self.provisioner.commit_rekey(egress.uplink_spi);
        self.egress_params = Some(egress);
        self.telemetry.incr_successful_rekeys();
        info!("Rekey successful");

        self.start_rekey_timer();
    }
}
