//! Encrypted backups of the application's persistent state and the restore
//! path that replays them.
//!
//! An artifact is written once: the sealed archive goes to primary storage,
//! its catalog record is created with `create_new`, and only the replication
//! sidecar changes afterwards.

pub mod archive;
pub mod components;
pub mod manager;
pub mod restore;
pub mod retention;
pub mod storage;

pub use archive::{ArchiveContents, BackupManifest, ManifestEntry};
pub use components::{DirectoryComponent, MockComponent, PostgresComponent, RedisComponent, StateComponent};
pub use manager::{BackupConfig, BackupManager, PruneReport};
pub use restore::{RestoreManager, RestoreReport};
pub use retention::{RetentionClass, RetentionPolicy};
pub use storage::{BackupCatalog, CatalogEntry, LocalObjectStore, MockObjectStore, ObjectStore, StorageLocation};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::deployment::environment::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Database,
    Cache,
    FileStore,
    Configuration,
}

impl ComponentKind {
    /// Snapshot order. A failure part-way leaves a manifest that visibly
    /// stops at the failed component.
    pub const SNAPSHOT_ORDER: [ComponentKind; 4] = [
        ComponentKind::Database,
        ComponentKind::Cache,
        ComponentKind::FileStore,
        ComponentKind::Configuration,
    ];

    /// Restore order: leaves first, database last.
    pub const RESTORE_ORDER: [ComponentKind; 4] = [
        ComponentKind::Configuration,
        ComponentKind::FileStore,
        ComponentKind::Cache,
        ComponentKind::Database,
    ];

    /// Only the cache may be absent from an artifact.
    pub fn is_optional(self) -> bool {
        matches!(self, ComponentKind::Cache)
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ComponentKind::Database => "database.dump",
            ComponentKind::Cache => "cache.rdb",
            ComponentKind::FileStore => "files.json",
            ComponentKind::Configuration => "config.json",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentKind::Database => "database",
            ComponentKind::Cache => "cache",
            ComponentKind::FileStore => "file_store",
            ComponentKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// Catalog record of one backup. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: Color,
    pub manifest: BackupManifest,
    /// `None` when the backup failed before anything was stored.
    pub primary: Option<StorageLocation>,
    pub key_ref: String,
    pub retention_class: RetentionClass,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl BackupArtifact {
    pub fn object_key(&self) -> String {
        object_key(self.id)
    }

    /// Complete and stored, so it can be restored.
    pub fn is_restorable(&self) -> bool {
        self.manifest.complete && self.primary.is_some()
    }
}

pub fn object_key(id: Uuid) -> String {
    format!("{}.swyd", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Pending,
    Replicated,
    PrimaryOnly,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStatus::Pending => f.write_str("pending"),
            ReplicationStatus::Replicated => f.write_str("replicated"),
            ReplicationStatus::PrimaryOnly => f.write_str("primary-only"),
        }
    }
}

/// Mutable replication sidecar for an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub status: ReplicationStatus,
    pub replica: Option<StorageLocation>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationRecord {
    pub fn new(status: ReplicationStatus) -> Self {
        Self {
            status,
            replica: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}
