//! Rekey scenarios: timer-driven rekey, atomic key swap, failed
//! installs.

use super::mocks::*;
use super::*;
use crate::status::{Code, Status};

#[tokio::test(start_paused = true)]
async fn test_rekey_timer_runs_full_cycle() {
    let harness = TestHarness::new(scenario_config());
    let (observer, mut rx) = RecordingObserver::new();
    establish_session(&harness, observer, &mut rx).await;

    let auth_before = harness.http.requests_to("auth").len();
    let egress_before = harness.http.requests_to("add_egress").len();

    // Run the paused clock past the 24 h rekey interval.
    tokio::time::advance(std::time::Duration::from_secs(24 * 60 * 60)).await;
    harness
        .wait_for_datapath_calls(1, |c| matches!(c, DatapathCall::SetKeyMaterials))
        .await;

    // A fresh auth + add-egress cycle ran.
    assert_eq!(harness.http.requests_to("auth").len(), auth_before + 1);
    assert_eq!(
        harness.http.requests_to("add_egress").len(),
        egress_before + 1
    );

    // The rekey request carried the signature over the new public
    // value and the previous uplink SPI.
    let rekey_request = harness.http.requests_to("add_egress").pop().unwrap();
    let ppn = &rekey_request.json_body.as_ref().unwrap()["ppn"];
    assert!(ppn["rekey_signature"].is_string());
    assert_eq!(ppn["previous_uplink_spi"], 123);

    // Counted, and the timer was re-armed for the next cycle.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while harness.telemetry.debug_info().successful_rekeys < 1 {
        assert!(tokio::time::Instant::now() < deadline, "rekey not recorded");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(harness.timers.active_timers() > 0);

    // The session stayed up throughout.
    expect_no_event(&mut rx).await;
    assert_eq!(harness.telemetry.debug_info().state, "DataPlaneConnected");
}

#[tokio::test(start_paused = true)]
async fn test_failed_key_install_keeps_old_params() {
    let harness = TestHarness::new(scenario_config());
    let (observer, mut rx) = RecordingObserver::new();
    let handle = establish_session(&harness, observer, &mut rx).await;

    harness
        .datapath
        .fail_set_keys_with(Status::internal("transform rejected"));
    handle.do_rekey();

    assert_eq!(
        next_event(&mut rx).await,
        ObserverEvent::ControlPlaneDisconnected(Code::Internal)
    );
    // The swap never committed.
    assert_eq!(harness.telemetry.collect().successful_rekeys, 0);
    assert_eq!(harness.telemetry.debug_info().state, "SessionError");
}

#[tokio::test(start_paused = true)]
async fn test_rekey_ignored_when_not_connected() {
    let harness = TestHarness::new(scenario_config());
    harness.install_happy_routes();
    let (observer, mut rx) = RecordingObserver::new();
    let handle = harness.spawn_session(observer, None);

    // Before Start nothing is provisioned; a rekey input must not
    // produce any traffic or notification.
    handle.do_rekey();
    expect_no_event(&mut rx).await;
    assert!(harness.http.requests_to("auth").is_empty());
}
