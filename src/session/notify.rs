//! Observer notification queue.
//!
//! Observer callbacks run on a dedicated notifier task, never on the
//! session worker, so an observer that calls back into the session
//! cannot re-enter the state machine mid-handler.

use crate::platform::NetworkInfo;
use crate::status::Status;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session lifecycle observer.
pub trait SessionObserver: Send + Sync {
    /// Control plane negotiated; the dataplane is not necessarily up.
    fn control_plane_connected(&self) {}

    /// Control plane is broken, which implies no dataplane either.
    fn control_plane_disconnected(&self, status: &Status) {
        let _ = status;
    }

    /// Non-recoverable; the engine must be torn down.
    fn permanent_failure(&self, status: &Status) {
        let _ = status;
    }

    fn datapath_connecting(&self) {}

    /// Tunnel is up for user traffic.
    fn datapath_connected(&self) {}

    /// User traffic is not flowing; the control plane is still up.
    fn datapath_disconnected(&self, network: &NetworkInfo, status: &Status) {
        let _ = (network, status);
    }
}

enum Notification {
    ControlPlaneConnected,
    ControlPlaneDisconnected(Status),
    PermanentFailure(Status),
    DatapathConnecting,
    DatapathConnected,
    DatapathDisconnected(NetworkInfo, Status),
}

/// Posts notifications onto the notifier task.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Spawn the notifier task delivering to `observer`.
    pub(crate) fn spawn(observer: Arc<dyn SessionObserver>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match notification {
                    Notification::ControlPlaneConnected => observer.control_plane_connected(),
                    Notification::ControlPlaneDisconnected(status) => {
                        observer.control_plane_disconnected(&status)
                    }
                    Notification::PermanentFailure(status) => observer.permanent_failure(&status),
                    Notification::DatapathConnecting => observer.datapath_connecting(),
                    Notification::DatapathConnected => observer.datapath_connected(),
                    Notification::DatapathDisconnected(network, status) => {
                        observer.datapath_disconnected(&network, &status)
                    }
                }
            }
        });
        Self { tx }
    }

    pub(crate) fn control_plane_connected(&self) {
        let _ = self.tx.send(Notification::ControlPlaneConnected);
    }

    pub(crate) fn control_plane_disconnected(&self, status: Status) {
        let _ = self.tx.send(Notification::ControlPlaneDisconnected(status));
    }

    pub(crate) fn permanent_failure(&self, status: Status) {
        let _ = self.tx.send(Notification::PermanentFailure(status));
    }

    pub(crate) fn datapath_connecting(&self) {
        let _ = self.tx.send(Notification::DatapathConnecting);
    }

    pub(crate) fn datapath_connected(&self) {
        let _ = self.tx.send(Notification::DatapathConnected);
    }

    pub(crate) fn datapath_disconnected(&self, network: NetworkInfo, status: Status) {
        let _ = self
            .tx
            .send(Notification::DatapathDisconnected(network, status));
    }
}
