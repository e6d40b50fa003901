//! Session input messages.
//!
//! Every external input — lifecycle calls, platform network changes,
//! datapath notifications, provisioning completions, timer expiries —
//! enters the session as one of these messages on a single queue.
//! Processing order is enqueue order.

use crate::datapath::TransformParams;
use crate::egress::ProvisionedDataplane;
use crate::platform::NetworkInfo;
use crate::status::Status;
use crate::timer::TimerId;
use std::fmt;

pub enum SessionEvent {
    Start,
    Stop {
        force_fail_open: bool,
    },
    SetNetwork(Option<NetworkInfo>),
    DatapathEstablished {
        /// Network the establishment refers to; stale reports about a
        /// superseded network are discarded.
        network_id: u64,
    },
    DatapathFailed {
        network_id: u64,
        status: Status,
    },
    DatapathPermanentFailure {
        status: Status,
    },
    Provisioned {
        dataplane: Box<ProvisionedDataplane>,
        transform_params: Option<TransformParams>,
        is_rekey: bool,
    },
    ProvisioningFailure {
        status: Status,
        permanent: bool,
    },
    DoRekey,
    UplinkMtuUpdate {
        uplink_mtu: u16,
        tunnel_mtu: u16,
    },
    DownlinkMtuUpdate {
        downlink_mtu: u16,
    },
    /// Completion of an update-path-info POST.
    UpdatePathInfoResult {
        downlink_mtu: u16,
        http_code: u16,
    },
    ForceTunnelUpdate,
    TimerExpired(TimerId),
}

impl SessionEvent {
    /// Variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "Start",
            SessionEvent::Stop { .. } => "Stop",
            SessionEvent::SetNetwork(_) => "SetNetwork",
            SessionEvent::DatapathEstablished { .. } => "DatapathEstablished",
            SessionEvent::DatapathFailed { .. } => "DatapathFailed",
            SessionEvent::DatapathPermanentFailure { .. } => "DatapathPermanentFailure",
            SessionEvent::Provisioned { .. } => "Provisioned",
            SessionEvent::ProvisioningFailure { .. } => "ProvisioningFailure",
            SessionEvent::DoRekey => "DoRekey",
            SessionEvent::UplinkMtuUpdate { .. } => "UplinkMtuUpdate",
            SessionEvent::DownlinkMtuUpdate { .. } => "DownlinkMtuUpdate",
            SessionEvent::UpdatePathInfoResult { .. } => "UpdatePathInfoResult",
            SessionEvent::ForceTunnelUpdate => "ForceTunnelUpdate",
            SessionEvent::TimerExpired(_) => "TimerExpired",
        }
    }
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionEvent::{}", self.name())
    }
}
