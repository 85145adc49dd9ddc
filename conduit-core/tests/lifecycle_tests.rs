//! Connection lifecycle tests against a scripted driver
//!
//! These tests verify:
//! 1. Open reaches Connected and replies once children are running
//! 2. A failed connection recovers through backoff and reports it
//! 3. Backoff exhaustion gives up, fails pending requesters and stays reachable
//! 4. Close is idempotent and shutdown terminates the connection
//! 5. Retrieval commands never fail, even while the connection is failed

use conduit_core::connection::status::ResourceKind;
use conduit_core::connection::{ConnectionActor, ConnectionHandle};
use conduit_core::core::{ConnectionError, ConnectivityStatus, DesiredStatus, FailureKind, RecoveryStatus};
use conduit_core::dispatch::ForwardedSignal;
use conduit_core::monitoring::LogLevel;
use conduit_core::testing::{
    create_fast_config, create_test_spec, ConnectBehavior, DriverCall, EchoMapper, ScriptedDriver,
};
use conduit_core::ConnectivityConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn spawn_connection(
    driver: Arc<ScriptedDriver>,
    config: ConnectivityConfig,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ForwardedSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnectionActor::spawn(
        create_test_spec("orders"),
        driver,
        Arc::new(EchoMapper),
        tx,
        Arc::new(config),
    )
    .unwrap();
    (handle, rx)
}

/// Poll status until `live_status` matches, advancing (paused) time between polls
async fn wait_for_status(handle: &ConnectionHandle, expected: ConnectivityStatus) {
    for _ in 0..50 {
        if handle.retrieve_status().await.unwrap().live_status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection never reached {expected}");
}

#[cfg(test)]
mod opening {
    use super::*;

    /// Test: Open replies after the driver connected and children started
    #[tokio::test(start_paused = true)]
    async fn test_open_reaches_connected() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        let reply = handle.open().await.unwrap();
        assert!(reply.is_success());

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.live_status, ConnectivityStatus::Open);
        assert_eq!(status.desired_status, DesiredStatus::Open);
        assert_eq!(status.failure_count, 0);

        let calls = driver.calls();
        assert!(calls.contains(&DriverCall::StartPublisher));
        assert!(calls.contains(&DriverCall::StartConsumers));
        assert!(driver.intake().is_some());

        let metrics = handle.retrieve_metrics().await.unwrap();
        assert!(metrics.connected);
    }

    /// Test: Opening an open connection is an immediate success
    #[tokio::test(start_paused = true)]
    async fn test_open_twice_connects_once() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        handle.open().await.unwrap();
        handle.open().await.unwrap();
        assert_eq!(driver.connect_count(), 1);
    }

    /// Test: A configuration rejection is retried on the connect deadline
    #[tokio::test(start_paused = true)]
    async fn test_misconfigured_connect_is_retried() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push_script([ConnectBehavior::Reject(ConnectionError::Configuration(
            "unknown host".into(),
        ))]);
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        assert!(handle.open().await.unwrap().is_success());
        assert_eq!(driver.connect_count(), 2);

        let logs = handle.retrieve_logs().await.unwrap();
        assert!(logs.entries.iter().any(|e| e.level == LogLevel::Failure && e.message.contains("unknown host")));
    }
}

#[cfg(test)]
mod recovery {
    use super::*;

    /// Test: A failure followed by a success ends Connected with recovery Succeeded
    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_one_failure() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push_script([
            ConnectBehavior::Fail(ConnectionError::Transient("connection refused".into())),
            ConnectBehavior::Succeed,
        ]);
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        assert!(handle.open().await.unwrap().is_success());

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.live_status, ConnectivityStatus::Open);
        assert_eq!(status.recovery_status, RecoveryStatus::Succeeded);
        assert_eq!(status.failure_count, 0);
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(handle.retrieve_metrics().await.unwrap().reconnect_attempts, 1);
    }

    /// Test: A dropped connection reconnects on its own
    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_reconnects() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));
        handle.open().await.unwrap();

        assert!(driver.drop_connection(ConnectionError::Transient("socket closed".into())));
        wait_for_status(&handle, ConnectivityStatus::Open).await;

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.recovery_status, RecoveryStatus::Succeeded);
        assert!(driver.calls().contains(&DriverCall::Cleanup));
        assert_eq!(driver.connect_count(), 2);
    }

    /// Test: Exhausted backoff fails the requester and lands in a reachable state
    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhaustion() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.set_default_behavior(ConnectBehavior::Fail(ConnectionError::Transient(
            "connection refused".into(),
        )));
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(2));

        let failure = handle.open().await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(driver.connect_count(), 3);

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.recovery_status, RecoveryStatus::BackoffLimitReached);
        assert_eq!(status.live_status, ConnectivityStatus::Failed);

        // a new open starts a fresh episode
        driver.set_default_behavior(ConnectBehavior::Succeed);
        assert!(handle.open().await.unwrap().is_success());
    }
}

#[cfg(test)]
mod closing {
    use super::*;

    /// Test: Closing twice succeeds twice and disconnects once
    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));
        handle.open().await.unwrap();

        assert!(handle.close().await.unwrap().is_success());
        assert!(handle.close().await.unwrap().is_success());

        let disconnects = driver
            .calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::Disconnect { .. }))
            .count();
        assert_eq!(disconnects, 1);

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.live_status, ConnectivityStatus::Closed);
        assert_eq!(status.desired_status, DesiredStatus::Closed);
        assert!(!handle.retrieve_metrics().await.unwrap().connected);
    }

    /// Test: Shutdown terminates the actor and later commands fail
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));
        handle.open().await.unwrap();

        assert!(handle.shutdown().await.unwrap().is_success());
        handle.terminated().await;
        assert!(!handle.is_alive());
        assert!(handle.open().await.is_err());
    }

    /// Test: A disconnect that never completes fails the close on its deadline
    #[tokio::test(start_paused = true)]
    async fn test_disconnect_deadline() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.set_disconnect_hangs(true);
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));
        handle.open().await.unwrap();

        let failure = handle.close().await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.live_status, ConnectivityStatus::Failed);
        assert!(handle.is_alive());
    }
}

#[cfg(test)]
mod retrieval {
    use super::*;

    /// Test: A failed connection still reports every expected child
    #[tokio::test(start_paused = true)]
    async fn test_failed_status_has_placeholders() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.set_default_behavior(ConnectBehavior::Fail(ConnectionError::Transient("refused".into())));
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(1));
        assert!(handle.open().await.is_err());

        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.live_status, ConnectivityStatus::Failed);
        assert_eq!(status.resources_of(ResourceKind::Source).count(), 1);
        assert_eq!(status.resources_of(ResourceKind::Target).count(), 1);
        assert!(status
            .resources
            .iter()
            .all(|r| r.status == ConnectivityStatus::Closed));
    }

    /// Test: Test commands run on a throwaway instance
    #[tokio::test(start_paused = true)]
    async fn test_connection_test_command() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        assert!(handle.test(create_test_spec("candidate")).await.unwrap().is_success());

        driver.set_test_result(Err(ConnectionError::Configuration("bad credentials".into())));
        let failure = handle.test(create_test_spec("candidate")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Configuration);

        // the managed connection itself was never touched
        let status = handle.retrieve_status().await.unwrap();
        assert_eq!(status.desired_status, DesiredStatus::Closed);
        assert_eq!(driver.connect_count(), 0);
    }

    /// Test: A test instance that cannot be built still answers its requester
    #[tokio::test(start_paused = true)]
    async fn test_unbuildable_test_instance_replies_failure() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        let failure = handle.test(create_test_spec("")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unknown);
        assert!(!driver.calls().contains(&DriverCall::Test));

        // the managed connection keeps answering
        assert!(handle.retrieve_status().await.is_ok());
    }

    /// Test: Metrics reset zeroes counters but keeps gauges
    #[tokio::test(start_paused = true)]
    async fn test_metrics_reset() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.push_script([ConnectBehavior::Fail(ConnectionError::Transient("refused".into()))]);
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));
        handle.open().await.unwrap();

        assert_eq!(handle.retrieve_metrics().await.unwrap().reconnect_attempts, 1);
        handle.reset_metrics().await.unwrap();

        let metrics = handle.retrieve_metrics().await.unwrap();
        assert_eq!(metrics.reconnect_attempts, 0);
        assert!(metrics.connected);
    }

    /// Test: Enabled logs record informational entries until reset
    #[tokio::test(start_paused = true)]
    async fn test_logs_enable_and_reset() {
        let driver = Arc::new(ScriptedDriver::new());
        let (handle, _forwarded) = spawn_connection(driver.clone(), create_fast_config(3));

        handle.enable_logs().await.unwrap();
        handle.open().await.unwrap();
        let logs = handle.retrieve_logs().await.unwrap();
        assert!(logs.enabled_since.is_some());
        assert!(logs.entries.iter().any(|e| e.level == LogLevel::Success));

        handle.reset_logs().await.unwrap();
        assert!(handle.retrieve_logs().await.unwrap().entries.is_empty());
    }
}
