mod common;

use chrono::Duration as ChronoDuration;

use common::*;
use switchyard::backup::archive;
use switchyard::backup::{ComponentKind, ObjectStore, ReplicationStatus, RetentionClass};
use switchyard::deployment::Color;
use switchyard::error::AppError;
use switchyard::services::notification::AlertSeverity;

#[tokio::test]
async fn test_backup_then_restore_replays_every_component() {
    let h = Harness::new().await;

    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    assert!(artifact.is_restorable());
    assert_eq!(artifact.manifest.entries.len(), 4);
    assert!(h.primary.contains(&artifact.object_key()));

    let report = h.restores.restore(&artifact, Color::B).await.unwrap();

    assert_eq!(
        report.restored,
        vec![
            ComponentKind::Configuration,
            ComponentKind::FileStore,
            ComponentKind::Cache,
            ComponentKind::Database,
        ]
    );
    assert!(report.skipped.is_empty());
    assert_eq!(h.database.restored(), vec![(Color::B, b"pg-dump-v1".to_vec())]);
    assert_eq!(h.cache.restored(), vec![(Color::B, b"redis-rdb".to_vec())]);
    assert_eq!(h.file_store.restored(), vec![(Color::B, b"uploads-tree".to_vec())]);
    assert_eq!(h.configuration.restored(), vec![(Color::B, b"app.toml".to_vec())]);

    for entry in &artifact.manifest.entries {
        assert_eq!(entry.checksum.len(), 64);
    }
}

#[tokio::test]
async fn test_retention_windows_follow_class() {
    let h = Harness::new().await;

    let daily = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    let weekly = h.backups.create_backup(Color::A, RetentionClass::Weekly).await.unwrap();

    assert_eq!(daily.expires_at - daily.created_at, ChronoDuration::days(365));
    assert_eq!(weekly.expires_at - weekly.created_at, ChronoDuration::days(2555));
}

#[tokio::test]
async fn test_prune_deletes_expired_but_keeps_newest() {
    let h = Harness::new().await;

    let older = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    h.backups.await_all_replication().await;
    assert!(h.replica.contains(&older.object_key()));

    // Both are past their expiry a year and a half from now
    let report = h.backups.prune_at(newer.created_at + ChronoDuration::days(540)).await.unwrap();

    assert_eq!(report.deleted, vec![older.id]);
    assert_eq!(report.protected, vec![newer.id]);
    assert!(!h.primary.contains(&older.object_key()));
    assert!(!h.replica.contains(&older.object_key()));
    assert!(h.primary.contains(&newer.object_key()));

    let remaining: Vec<_> = h.backups.list().await.unwrap().into_iter().map(|e| e.artifact.id).collect();
    assert_eq!(remaining, vec![newer.id]);
}

#[tokio::test]
async fn test_prune_before_expiry_deletes_nothing() {
    let h = Harness::new().await;
    h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    h.backups.create_backup(Color::A, RetentionClass::Weekly).await.unwrap();

    let report = h.backups.prune().await.unwrap();

    assert!(report.deleted.is_empty());
    assert_eq!(report.retained, 2);
}

#[tokio::test]
async fn test_tampered_component_aborts_restore_before_touching_target() {
    let h = Harness::new().await;
    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    let key = artifact.object_key();

    // Reseal with a valid key so only the per-component checksum catches it
    let sealed = h.primary.get(&key).await.unwrap();
    let mut contents = archive::open(&sealed, h.backups.cipher()).unwrap();
    let original = contents.blobs[&ComponentKind::Database].clone();
    contents.blobs.insert(ComponentKind::Database, tampered(&original));
    h.primary.overwrite(&key, archive::seal(&contents, h.backups.cipher()).unwrap());

    let err = h.restores.restore(&artifact, Color::A).await.unwrap_err();

    assert!(matches!(err, AppError::RestoreIntegrityError(_)));
    assert!(err.to_string().contains("database"));
    assert_eq!(h.configuration.restore_count(), 0);
    assert_eq!(h.file_store.restore_count(), 0);
    assert_eq!(h.cache.restore_count(), 0);
    assert_eq!(h.database.restore_count(), 0);
    assert_eq!(h.sink.count_by_severity(AlertSeverity::Critical), 1);
}

#[tokio::test]
async fn test_corrupted_ciphertext_fails_authentication() {
    let h = Harness::new().await;
    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    let key = artifact.object_key();

    let mut sealed = h.primary.get(&key).await.unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0xff;
    h.primary.overwrite(&key, sealed);

    let err = h.restores.restore_by_id(artifact.id, Color::A).await.unwrap_err();

    assert!(matches!(err, AppError::RestoreIntegrityError(_)));
    assert_eq!(h.configuration.restore_count(), 0);
}

#[tokio::test]
async fn test_missing_cache_is_skipped_on_restore() {
    let h = Harness::new().await;
    h.cache.set_data(None);

    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    assert!(artifact.manifest.entry(ComponentKind::Cache).is_none());
    assert!(artifact.manifest.complete);

    let report = h.restores.restore(&artifact, Color::B).await.unwrap();

    assert_eq!(report.skipped, vec![ComponentKind::Cache]);
    assert_eq!(report.restored.len(), 3);
    assert_eq!(h.cache.restore_count(), 0);
    assert_eq!(h.database.restore_count(), 1);
}

#[tokio::test]
async fn test_component_failure_leaves_truncated_manifest() {
    let h = Harness::new().await;
    h.file_store.set_fail_snapshot(true);

    let err = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap_err();
    assert!(matches!(err, AppError::BackupFailure(_)));

    let entries = h.backups.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].artifact;
    assert!(!record.manifest.complete);
    assert_eq!(record.manifest.failed_component, Some(ComponentKind::FileStore));
    assert_eq!(record.manifest.entries.len(), 2);
    assert!(!record.is_restorable());
    assert!(h.backups.latest().await.unwrap().is_none());

    let restore_err = h.restores.restore(record, Color::A).await.unwrap_err();
    assert!(matches!(restore_err, AppError::RestoreIntegrityError(_)));
}

#[tokio::test]
async fn test_replication_failure_keeps_primary_only_artifact() {
    let h = Harness::new().await;
    h.replica.set_fail_puts(true);

    let artifact = h.backups.create_backup(Color::A, RetentionClass::Weekly).await.unwrap();
    let replication = h.backups.await_replication(artifact.id).await.unwrap();

    assert_eq!(replication.status, ReplicationStatus::PrimaryOnly);
    assert!(replication.error.is_some());
    assert!(replication.replica.is_none());
    assert!(h.replica.is_empty());

    let warning = h
        .sink
        .alerts()
        .into_iter()
        .find(|a| a.dedup_key == format!("backup:{}:replication", artifact.id))
        .expect("replication alert");
    assert_eq!(warning.severity, AlertSeverity::Warning);

    let report = h.restores.restore(&artifact, Color::A).await.unwrap();
    assert_eq!(report.restored.len(), 4);
}

#[tokio::test]
async fn test_restore_falls_back_to_replica() {
    let h = Harness::new().await;
    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    let replication = h.backups.await_replication(artifact.id).await.unwrap();
    assert_eq!(replication.status, ReplicationStatus::Replicated);

    h.primary.set_fail_gets(true);
    let report = h.restores.restore(&artifact, Color::B).await.unwrap();

    assert_eq!(report.restored.len(), 4);
    assert_eq!(h.database.restored()[0].1, b"pg-dump-v1".to_vec());
}

#[tokio::test]
async fn test_transient_component_restore_is_retried() {
    let h = Harness::new().await;
    let artifact = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    h.database.fail_restores(2);

    let report = h.restores.restore(&artifact, Color::A).await.unwrap();

    assert_eq!(report.restored.last(), Some(&ComponentKind::Database));
    assert_eq!(h.database.restore_count(), 1);
}

#[tokio::test]
async fn test_latest_returns_newest_restorable() {
    let h = Harness::new().await;
    let good = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
    h.database.set_fail_snapshot(true);
    let _ = h.backups.create_backup(Color::A, RetentionClass::Daily).await.unwrap_err();

    let latest = h.backups.latest().await.unwrap().expect("restorable artifact");
    assert_eq!(latest.id, good.id);
}
