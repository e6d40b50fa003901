//! Telemetry counters and debug snapshots.
//!
//! The one place callers may read off-worker: counters and the debug
//! snapshot live behind a single mutex, and `collect` hands back an
//! owned snapshot while resetting the counters (debug state survives
//! collection).

use std::sync::Mutex;
use std::time::Duration;

/// Latency series are capped so a flapping session cannot grow them
/// without bound between collections.
const LATENCY_COLLECTION_LIMIT: usize = 5;

/// Counter snapshot returned by [`Telemetry::collect`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub network_switches: u32,
    pub successful_network_switches: u32,
    pub successful_rekeys: u32,
    pub control_plane_failures: u32,
    pub data_plane_failures: u32,
    pub session_restarts: u32,
    pub token_unblind_failures: u32,
    pub auth_latencies: Vec<Duration>,
    pub oauth_latencies: Vec<Duration>,
    pub zinc_latencies: Vec<Duration>,
    pub egress_latencies: Vec<Duration>,
    pub network_switch_latencies: Vec<Duration>,
}

/// Debug-info snapshot; immutable copy handed out under the mutex.
#[derive(Clone, Debug, Default)]
pub struct SessionDebugInfo {
    pub state: String,
    pub latest_status: String,
    pub active_network_id: Option<u64>,
    pub successful_rekeys: u32,
    pub network_switches: u32,
}

#[derive(Default)]
struct Inner {
    counters: TelemetrySnapshot,
    debug: SessionDebugInfo,
}

/// Shared telemetry sink for the session and its components.
#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<Inner>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_network_switches(&self) {
        self.with(|inner| {
            inner.counters.network_switches += 1;
            inner.debug.network_switches = inner.counters.network_switches;
        });
    }

    pub fn incr_successful_network_switches(&self) {
        self.with(|inner| inner.counters.successful_network_switches += 1);
    }

    pub fn incr_successful_rekeys(&self) {
        self.with(|inner| {
            inner.counters.successful_rekeys += 1;
            inner.debug.successful_rekeys = inner.counters.successful_rekeys;
        });
    }

    pub fn incr_control_plane_failures(&self) {
        self.with(|inner| inner.counters.control_plane_failures += 1);
    }

    pub fn incr_data_plane_failures(&self) {
        self.with(|inner| inner.counters.data_plane_failures += 1);
    }

    pub fn incr_session_restarts(&self) {
        self.with(|inner| inner.counters.session_restarts += 1);
    }

    pub fn incr_token_unblind_failures(&self) {
        self.with(|inner| inner.counters.token_unblind_failures += 1);
    }

    pub fn record_auth_latency(&self, latency: Duration) {
        self.with(|inner| push_latency(&mut inner.counters.auth_latencies, latency));
    }

    pub fn record_oauth_latency(&self, latency: Duration) {
        self.with(|inner| push_latency(&mut inner.counters.oauth_latencies, latency));
    }

    pub fn record_zinc_latency(&self, latency: Duration) {
        self.with(|inner| push_latency(&mut inner.counters.zinc_latencies, latency));
    }

    pub fn record_egress_latency(&self, latency: Duration) {
        self.with(|inner| push_latency(&mut inner.counters.egress_latencies, latency));
    }

    pub fn record_network_switch_latency(&self, latency: Duration) {
        self.with(|inner| push_latency(&mut inner.counters.network_switch_latencies, latency));
    }

    /// Take the counters, resetting them to zero.
    pub fn collect(&self) -> TelemetrySnapshot {
        let mut inner = self.inner.lock().expect("telemetry mutex poisoned");
        std::mem::take(&mut inner.counters)
    }

    pub fn set_debug_state(&self, state: impl Into<String>, latest_status: impl Into<String>) {
        self.with(|inner| {
            inner.debug.state = state.into();
            inner.debug.latest_status = latest_status.into();
        });
    }

    pub fn set_debug_network(&self, network_id: Option<u64>) {
        self.with(|inner| inner.debug.active_network_id = network_id);
    }

    /// Immutable copy of the current debug snapshot.
    pub fn debug_info(&self) -> SessionDebugInfo {
        self.inner
            .lock()
            .expect("telemetry mutex poisoned")
            .debug
            .clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().expect("telemetry mutex poisoned"))
    }
}

fn push_latency(latencies: &mut Vec<Duration>, latency: Duration) {
    if latencies.len() < LATENCY_COLLECTION_LIMIT {
        latencies.push(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_resets_counters() {
        let telemetry = Telemetry::new();
        telemetry.incr_network_switches();
        telemetry.incr_network_switches();
        telemetry.incr_successful_rekeys();
        telemetry.record_oauth_latency(Duration::from_millis(10));

        let snapshot = telemetry.collect();
        assert_eq!(snapshot.network_switches, 2);
        assert_eq!(snapshot.successful_rekeys, 1);
        assert_eq!(snapshot.oauth_latencies.len(), 1);

        let snapshot = telemetry.collect();
        assert_eq!(snapshot, TelemetrySnapshot::default());
    }

    #[test]
    fn test_latency_collection_cap() {
        let telemetry = Telemetry::new();
        for _ in 0..10 {
            telemetry.record_egress_latency(Duration::from_millis(1));
        }
        assert_eq!(
            telemetry.collect().egress_latencies.len(),
            LATENCY_COLLECTION_LIMIT
        );
    }

    #[test]
    fn test_debug_info_survives_collect() {
        let telemetry = Telemetry::new();
        telemetry.set_debug_state("DataPlaneConnected", "ok");
        telemetry.set_debug_network(Some(123));
        telemetry.collect();

        let debug = telemetry.debug_info();
        assert_eq!(debug.state, "DataPlaneConnected");
        assert_eq!(debug.active_network_id, Some(123));
    }
}
