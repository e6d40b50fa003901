//! Engine-level (reconnector) scenarios: retry with backoff, deadline
//! reporting, credential invalidation, permanent failures.

use super::mocks::*;
use super::*;
use crate::reconnector::{Reconnector, ReconnectorHandle};
use crate::status::Code;
use std::time::Duration;

fn spawn_reconnector(
    harness: &TestHarness,
    observer: std::sync::Arc<RecordingEngineObserver>,
) -> ReconnectorHandle {
    let (reconnector, handle) = Reconnector::new(
        std::sync::Arc::clone(&harness.config),
        harness.http.clone(),
        harness.oauth.clone(),
        harness.vpn.clone(),
        harness.datapath.clone(),
        std::sync::Arc::clone(&harness.timers),
        std::sync::Arc::clone(&harness.telemetry),
        observer,
    );
    tokio::spawn(reconnector.run());
    handle
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_auth_reports_internal_then_deadline() {
    // No routes at all: the auth backend is unreachable.
    let harness = TestHarness::new(scenario_config());
    let (observer, mut rx) = RecordingEngineObserver::new();
    let handle = spawn_reconnector(&harness, observer);
    handle.start();

    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);

    // First: the session's own failure.
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::Disconnected {
            code: Code::Internal,
            is_blocking_traffic: false,
        }
    );
    // Second: the teardown before the backoff wait, reported as a
    // deadline with traffic not blocked (no tunnel exists).
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::Disconnected {
            code: Code::DeadlineExceeded,
            is_blocking_traffic: false,
        }
    );
    assert_eq!(next_event(&mut rx).await, EngineEvent::WaitingToReconnect);

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_timer_spawns_fresh_session() {
    let harness = TestHarness::new(scenario_config());
    let (observer, mut rx) = RecordingEngineObserver::new();
    let handle = spawn_reconnector(&harness, observer);
    handle.start();

    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);
    // Failure cycle runs: Disconnected ×2, WaitingToReconnect.
    next_event(&mut rx).await;
    next_event(&mut rx).await;
    assert_eq!(next_event(&mut rx).await, EngineEvent::WaitingToReconnect);

    // Make the backends healthy before the backoff elapses.
    harness.install_happy_routes();
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);
    assert_eq!(next_event(&mut rx).await, EngineEvent::ControlPlaneConnected);

    // Hand it a network and let the datapath come up.
    handle.set_network(Some(cellular_network(123)));
    harness
        .wait_for_datapath_calls(1, |c| matches!(c, DatapathCall::SwitchNetwork { .. }))
        .await;
    harness.datapath.notify_established(123);
    assert_eq!(next_event(&mut rx).await, EngineEvent::Connected);

    let snapshot = harness.telemetry.collect();
    assert_eq!(snapshot.session_restarts, 2);
    assert_eq!(snapshot.control_plane_failures, 1);

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_401_clears_oauth_token() {
    let harness = TestHarness::new(scenario_config());
    harness
        .http
        .route_response("initial_data", http_error(401, "unauthorized"));
    let (observer, mut rx) = RecordingEngineObserver::new();
    let handle = spawn_reconnector(&harness, observer);
    handle.start();

    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::Disconnected {
            code: Code::Unauthenticated,
            is_blocking_traffic: false,
        }
    );

    // The token the request used was invalidated.
    assert_eq!(
        harness.oauth.cleared.lock().unwrap().as_slice(),
        &["oauth-token-1"]
    );

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_stops_retrying() {
    let harness = TestHarness::new(scenario_config());
    harness
        .http
        .route_response("initial_data", http_error(403, "forbidden"));
    let (observer, mut rx) = RecordingEngineObserver::new();
    let handle = spawn_reconnector(&harness, observer);
    handle.start();

    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::PermanentFailure(Code::PermissionDenied)
    );

    // No reconnection is ever scheduled.
    tokio::time::advance(Duration::from_secs(120)).await;
    expect_no_event(&mut rx).await;
    assert_eq!(harness.telemetry.collect().session_restarts, 1);

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_set_network_none_pauses_engine() {
    let harness = TestHarness::new(scenario_config());
    harness.install_happy_routes();
    let (observer, mut rx) = RecordingEngineObserver::new();
    let handle = spawn_reconnector(&harness, observer);
    handle.start();

    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);
    assert_eq!(next_event(&mut rx).await, EngineEvent::ControlPlaneConnected);

    // Airplane mode: the session is torn down and nothing restarts
    // until a network returns.
    handle.set_network(None);
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::Disconnected {
            code: Code::Internal,
            is_blocking_traffic: false,
        }
    );
    tokio::time::advance(Duration::from_secs(120)).await;
    expect_no_event(&mut rx).await;

    // Network returns: a reconnection cycle begins.
    handle.set_network(Some(cellular_network(55)));
    assert_eq!(
        next_event(&mut rx).await,
        EngineEvent::Disconnected {
            code: Code::DeadlineExceeded,
            is_blocking_traffic: false,
        }
    );
    assert_eq!(next_event(&mut rx).await, EngineEvent::WaitingToReconnect);
    assert_eq!(next_event(&mut rx).await, EngineEvent::Connecting);

    handle.stop();
}
