//! Session and engine scenario tests.
//!
//! Tests drive a real session worker against mock collaborators: a
//! scripted HTTP transport (with a genuine blind-signing handler), a
//! recording datapath whose notifications the tests trigger, a
//! recording VPN service, and observers that expose notifications as
//! awaitable channels. Timers run on the paused tokio clock, so the
//! 500 ms reattempt delay and the 24 h rekey interval elapse
//! instantly while keeping their ordering.


mod engine;
mod mtu_flow;
mod rekey_flow;

use crate::config::{DatapathProtocol, EngineConfig};
use crate::platform::{NetworkInfo, NetworkType};
use crate::session::notify::SessionObserver;
use crate::session::{Session, SessionHandle};
use crate::telemetry::Telemetry;
use crate::timer::TimerManager;
use mocks::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Base configuration for the happy-path scenario.
pub(crate) fn scenario_config() -> EngineConfig {
    EngineConfig {
        zinc_url: "auth".into(),
        brass_url: "add_egress".into(),
        initial_data_url: "initial_data".into(),
        update_path_info_url: "update_path_info".into(),
        service_type: "service_type".into(),
        datapath_protocol: DatapathProtocol::Bridge,
        ..Default::default()
    }
}

pub(crate) struct TestHarness {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) http: Arc<MockHttpTransport>,
    pub(crate) oauth: Arc<MockOAuth>,
    pub(crate) vpn: Arc<MockVpnService>,
    pub(crate) datapath: Arc<MockDatapath>,
    pub(crate) timers: Arc<TimerManager>,
    pub(crate) telemetry: Arc<Telemetry>,
}

impl TestHarness {
    pub(crate) fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            http: Arc::new(MockHttpTransport::new()),
            oauth: Arc::new(MockOAuth::default()),
            vpn: Arc::new(MockVpnService::default()),
            datapath: Arc::new(MockDatapath::default()),
            timers: Arc::new(TimerManager::new()),
            telemetry: Arc::new(Telemetry::new()),
        }
    }

    /// Script the backends for a successful provisioning: public key,
    /// blind signing, the literal egress response, and DNS for the
    /// control-plane hostname.
    pub(crate) fn install_happy_routes(&self) {
        self.http.route_response(
            "initial_data",
            json_ok(serde_json::json!({
                "pem": TEST_KEY_PAIR.pk.to_pem().unwrap(),
            })),
        );
        self.http.route("auth", blind_sign_handler("na4.p.example.com"));
        self.http.route_response(
            "add_egress",
            json_ok(serde_json::json!({
                "user_private_ip": [{
                    "ipv4_range": "10.2.2.123/32",
                    "ipv6_range": "fec2:0001::3/64",
                }],
                "egress_point_sock_addr": [
                    "64.9.240.165:2153",
                    "[2604:ca00:f001:4::5]:2153",
                ],
                "egress_point_public_value": "a22j+91TxHtS5qa625KCD5ybsyzPR1wkTDWHV2qSQQc=",
                "server_nonce": "Uzt2lEzyvZYzjLAP3E+dAA==",
                "uplink_spi": 123,
                "expiry": "2020-08-07T01:06:13+00:00",
            })),
        );
        self.http.route_dns("na4.p.example.com", "64.9.240.166");
    }

    pub(crate) fn spawn_session(
        &self,
        observer: Arc<dyn SessionObserver>,
        network: Option<NetworkInfo>,
    ) -> SessionHandle {
        let (session, handle) = Session::new(
            Arc::clone(&self.config),
            self.http.clone(),
            self.oauth.clone(),
            self.vpn.clone(),
            self.datapath.clone(),
            Arc::clone(&self.timers),
            Arc::clone(&self.telemetry),
            observer,
            network,
        );
        tokio::spawn(session.run());
        handle
    }

    /// Wait until the session debug snapshot reports `state`.
    pub(crate) async fn wait_for_state(&self, state: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.telemetry.debug_info().state == state {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for state {}, still in {}",
                state,
                self.telemetry.debug_info().state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the datapath recorded at least `count` calls of the
    /// kind selected by `filter`.
    pub(crate) async fn wait_for_datapath_calls(
        &self,
        count: usize,
        filter: impl Fn(&DatapathCall) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let seen = self.datapath.calls().iter().filter(|c| filter(c)).count();
            if seen >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} datapath calls, saw {}",
                count,
                seen
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub(crate) fn cellular_network(network_id: u64) -> NetworkInfo {
    NetworkInfo::new(network_id, NetworkType::Cellular)
}

/// Await the next observer event, failing on timeout.
pub(crate) async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an observer event")
        .expect("observer channel closed")
}

/// Assert no further observer events arrive within a grace window.
pub(crate) async fn expect_no_event<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected observer event: {:?}", event);
    }
}

/// Bring a session up through the full happy path: provision, start
/// datapath, set the network, establish. Returns the handle.
pub(crate) async fn establish_session(
    harness: &TestHarness,
    observer: Arc<dyn SessionObserver>,
    rx: &mut mpsc::UnboundedReceiver<ObserverEvent>,
) -> SessionHandle {
    harness.install_happy_routes();
    let handle = harness.spawn_session(observer, None);
    handle.start();
    assert_eq!(next_event(rx).await, ObserverEvent::ControlPlaneConnected);

    handle.set_network(Some(cellular_network(123)));
    assert_eq!(next_event(rx).await, ObserverEvent::DatapathConnecting);

    harness
        .wait_for_datapath_calls(1, |c| matches!(c, DatapathCall::SwitchNetwork { .. }))
        .await;
    harness.datapath.notify_established(123);
    assert_eq!(next_event(rx).await, ObserverEvent::DatapathConnected);
    harness.wait_for_state("DataPlaneConnected").await;
    handle
}
