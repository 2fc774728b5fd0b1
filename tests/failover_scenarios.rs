use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use switchyard::deployment::{
    Color, EnvironmentRole, ExternalAlarm, FailoverConfig, FailoverController, FailoverDecision, FailoverEventLog,
    FailoverOutcome, HealthMonitor, HealthOutcome, MockHealthProbe, MockRegionRouter, MockReplicaPromoter,
    SpoolAlarmFeed,
};
use switchyard::error::{AppError, RetryPolicy};
use switchyard::services::notification::{AlertChannel, AlertSeverity, MockAlertSink};
use switchyard::state::EnvironmentStateStore;

struct Rig {
    dir: TempDir,
    promoter: Arc<MockReplicaPromoter>,
    router: Arc<MockRegionRouter>,
    sink: Arc<MockAlertSink>,
    controller: Arc<FailoverController>,
}

fn rig(promoter: MockReplicaPromoter, promotion_timeout: Duration) -> Rig {
    let dir = TempDir::new().unwrap();
    let promoter = Arc::new(promoter);
    let router = Arc::new(MockRegionRouter::new());
    let sink = Arc::new(MockAlertSink::new());
    let mut alerts = AlertChannel::new();
    alerts.subscribe(sink.clone());

    let config = FailoverConfig {
        promotion_timeout,
        secondary_region: "eu-west".to_string(),
        replica_id: "pg-standby-1".to_string(),
        router_retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
        ..FailoverConfig::default()
    };
    let controller = Arc::new(FailoverController::new(
        config,
        promoter.clone(),
        router.clone(),
        FailoverEventLog::new(dir.path()),
        Arc::new(alerts),
    ));

    Rig { dir, promoter, router, sink, controller }
}

async fn live_store(dir: &TempDir, color: Color) -> EnvironmentStateStore {
    let store = EnvironmentStateStore::open(dir.path()).await.unwrap();
    store
        .update(|record| {
            record.env_mut(color).set_role(EnvironmentRole::Live);
            Ok(())
        })
        .await
        .unwrap();
    store
}

async fn wait_for_events(rig: &Rig, count: usize) {
    for _ in 0..300 {
        if rig.controller.events().await.unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} failover events", count);
}

#[tokio::test]
async fn test_sustained_outage_of_live_color_fails_over_once() {
    let r = rig(MockReplicaPromoter::new(), Duration::from_secs(1));
    let store = live_store(&r.dir, Color::A).await;
    let probe = Arc::new(MockHealthProbe::new().always(Color::A, HealthOutcome::Unhealthy));
    let monitor = Arc::new(HealthMonitor::new(probe.clone(), Duration::from_millis(100)));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(r.controller.clone().run(
        monitor,
        store,
        Duration::from_millis(5),
        None,
        shutdown_rx,
    ));

    wait_for_events(&r, 1).await;
    // Keep sampling the outage well past the threshold
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert!(probe.calls(Color::A) > 3);
    let events = r.controller.events().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, FailoverOutcome::Completed);
    assert_eq!(events[0].promoted_replica.as_deref(), Some("pg-standby-1"));
    assert_eq!(events[0].region, "eu-west");
    assert!(events[0].reason.contains("unhealthy"));

    assert_eq!(r.promoter.promoted(), vec!["pg-standby-1".to_string()]);
    assert_eq!(r.router.routed(), vec!["eu-west".to_string()]);
    assert!(r.controller.is_failed_over());
    assert_eq!(r.sink.count_by_severity(AlertSeverity::Critical), 1);
}

#[tokio::test]
async fn test_flapping_below_threshold_never_fails_over() {
    let r = rig(MockReplicaPromoter::new(), Duration::from_secs(1));
    let probe = Arc::new(MockHealthProbe::new());
    let monitor = HealthMonitor::new(probe.clone(), Duration::from_millis(100));

    for _ in 0..5 {
        probe.push(
            Color::A,
            &[HealthOutcome::Unhealthy, HealthOutcome::Unhealthy, HealthOutcome::Healthy],
        );
    }
    for _ in 0..15 {
        let result = monitor.check(Color::A).await;
        let decision = r.controller.on_health_result(&result).await.unwrap();
        assert_eq!(decision, FailoverDecision::Debounced);
    }

    assert!(r.controller.events().await.unwrap().is_empty());
    assert!(r.promoter.promoted().is_empty());
}

#[tokio::test]
async fn test_concurrent_trigger_while_promoting_is_ignored() {
    let r = rig(MockReplicaPromoter::new().with_delay(Duration::from_millis(150)), Duration::from_secs(2));

    let controller = r.controller.clone();
    let first = tokio::spawn(async move { controller.failover("primary region unreachable").await });
    for _ in 0..100 {
        if r.controller.is_in_progress() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let second = r.controller.failover("duplicate page").await.unwrap();
    assert_eq!(second, FailoverDecision::AlreadyInProgress);

    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, FailoverDecision::Executed(_)));

    let third = r.controller.failover("late page").await.unwrap();
    assert_eq!(third, FailoverDecision::AlreadyFailedOver);
    assert_eq!(r.promoter.promoted().len(), 1);
    assert_eq!(r.controller.events().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_promotion_timeout_is_final() {
    let r = rig(MockReplicaPromoter::new().with_delay(Duration::from_millis(300)), Duration::from_millis(30));

    let err = r.controller.failover("region down").await.unwrap_err();

    assert!(matches!(err, AppError::FailoverTimeout(_)));
    assert!(!err.is_retryable());
    assert!(r.router.routed().is_empty());
    assert_eq!(
        r.controller.failover("region still down").await.unwrap(),
        FailoverDecision::AlreadyFailedOver
    );

    let events = r.controller.events().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, FailoverOutcome::TimedOut);
}

#[tokio::test]
async fn test_spooled_alarm_triggers_failover_and_repeats_are_ignored() {
    let r = rig(MockReplicaPromoter::new(), Duration::from_secs(1));
    let store = EnvironmentStateStore::open(r.dir.path()).await.unwrap();
    let spool = r.dir.path().join("alarms");
    tokio::fs::create_dir_all(&spool).await.unwrap();

    let alarm = ExternalAlarm {
        alarm_id: "cw-1234".to_string(),
        reason: "regional outage".to_string(),
    };
    tokio::fs::write(spool.join("001.json"), serde_json::to_vec(&alarm).unwrap()).await.unwrap();

    let monitor = Arc::new(HealthMonitor::new(Arc::new(MockHealthProbe::new()), Duration::from_millis(100)));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(r.controller.clone().run(
        monitor,
        store,
        Duration::from_millis(5),
        Some(SpoolAlarmFeed::new(spool.clone())),
        shutdown_rx,
    ));

    wait_for_events(&r, 1).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    let events = r.controller.events().await.unwrap();
    assert!(events[0].reason.contains("cw-1234"));
    assert!(!spool.join("001.json").exists());

    assert_eq!(r.controller.on_alarm(&alarm).await.unwrap(), FailoverDecision::DuplicateAlarm);
}
