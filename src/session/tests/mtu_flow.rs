//! MTU update flows: tunnel rebuild on uplink updates, signed
//! path-info reports on downlink updates.

use super::mocks::*;
use super::*;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;

fn dynamic_mtu_config() -> crate::config::EngineConfig {
    let mut config = scenario_config();
    config.dynamic_mtu_enabled = true;
    config
}

async fn wait_for_path_info_requests(
    harness: &TestHarness,
    count: usize,
) -> Vec<crate::http::HttpRequest> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let requests = harness.http.requests_to("update_path_info");
        if requests.len() >= count {
            return requests;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} path info requests",
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_uplink_update_rebuilds_tunnel() {
    let harness = TestHarness::new(dynamic_mtu_config());
    let (observer, mut rx) = RecordingObserver::new();
    establish_session(&harness, observer, &mut rx).await;

    harness.datapath.notify_uplink_mtu(1400, 1340);
    harness
        .wait_for_datapath_calls(1, |c| matches!(c, DatapathCall::SwitchTunnel))
        .await;

    // The datapath paused across the fd swap and the new tunnel
    // carries the reported MTU.
    let calls = harness.datapath.calls();
    assert!(calls.contains(&DatapathCall::PrepareForTunnelSwitch));
    {
        let create_calls = harness.vpn.create_calls.lock().unwrap();
        let (tun_fd_data, _) = create_calls.last().unwrap();
        assert_eq!(tun_fd_data.mtu, Some(1340));
    }

    // The session stayed connected.
    expect_no_event(&mut rx).await;
    assert_eq!(harness.telemetry.debug_info().state, "DataPlaneConnected");
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_tunnel_mtu_is_a_no_op() {
    let harness = TestHarness::new(dynamic_mtu_config());
    let (observer, mut rx) = RecordingObserver::new();
    establish_session(&harness, observer, &mut rx).await;

    let tunnel_creates = harness.vpn.create_calls.lock().unwrap().len();
    // 1395 is the default tunnel MTU; only the uplink value changes.
    harness.datapath.notify_uplink_mtu(1400, 1395);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.vpn.create_calls.lock().unwrap().len(), tunnel_creates);
    assert!(!harness
        .datapath
        .calls()
        .contains(&DatapathCall::PrepareForTunnelSwitch));
}

#[tokio::test(start_paused = true)]
async fn test_downlink_update_posts_signed_path_info() {
    let harness = TestHarness::new(dynamic_mtu_config());
    harness.http.route_response(
        "update_path_info",
        json_ok(serde_json::json!({})),
    );
    let (observer, mut rx) = RecordingObserver::new();
    establish_session(&harness, observer, &mut rx).await;

    harness.datapath.notify_downlink_mtu(1380);
    let requests = wait_for_path_info_requests(&harness, 1).await;
    let body = requests[0].json_body.as_ref().unwrap();

    assert_eq!(body["session_id"], 123);
    assert_eq!(body["downlink_mtu"], 1380);
    assert_eq!(body["uplink_mtu"], 0);
    assert_eq!(body["apn_type"], "ppn");
    assert_eq!(body["control_plane_sock_addr"], "64.9.240.166:1849");
    // A well-formed Ed25519 signature rides along.
    let signature = BASE64
        .decode(body["mtu_update_signature"].as_str().unwrap())
        .unwrap();
    assert_eq!(signature.len(), 64);

    // Accepted: a repeat of the same value sends nothing new.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.datapath.notify_downlink_mtu(1380);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.http.requests_to("update_path_info").len(), 1);

    expect_no_event(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_path_info_is_not_remembered() {
    let harness = TestHarness::new(dynamic_mtu_config());
    harness
        .http
        .route_response("update_path_info", http_error(503, "overloaded"));
    let (observer, mut rx) = RecordingObserver::new();
    establish_session(&harness, observer, &mut rx).await;

    harness.datapath.notify_downlink_mtu(1380);
    wait_for_path_info_requests(&harness, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Non-disconnecting, and the value was not committed: the same
    // update is sent again.
    expect_no_event(&mut rx).await;
    harness.datapath.notify_downlink_mtu(1380);
    wait_for_path_info_requests(&harness, 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_mtu_updates_ignored_before_connection() {
    let harness = TestHarness::new(dynamic_mtu_config());
    harness.install_happy_routes();
    let (observer, mut rx) = RecordingObserver::new();
    let handle = harness.spawn_session(observer, None);
    handle.start();
    assert_eq!(next_event(&mut rx).await, ObserverEvent::ControlPlaneConnected);

    // No datapath yet: uplink updates are dropped (downlink updates
    // are allowed from control-plane-connected onward).
    harness.datapath.notify_uplink_mtu(1400, 1340);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness
        .datapath
        .calls()
        .contains(&DatapathCall::PrepareForTunnelSwitch));
}
