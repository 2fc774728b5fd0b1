use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::backup::ComponentKind;
use crate::deployment::environment::Color;
use crate::error::{AppError, Result};
use crate::services::encryption::ArchiveCipher;

/// Leading bytes of every sealed archive, also bound as associated data.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"SWYDARC1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub component: ComponentKind,
    pub file_name: String,
    /// Hex SHA-256 of the component bytes.
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn for_bytes(component: ComponentKind, bytes: &[u8]) -> Self {
        Self {
            component,
            file_name: component.file_name().to_string(),
            checksum: checksum(bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        self.size_bytes == bytes.len() as u64 && self.checksum == checksum(bytes)
    }
}

/// Ordered component list. `complete` is false when snapshotting stopped
/// early; `failed_component` then names where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub artifact_id: Uuid,
    pub source: Color,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    pub complete: bool,
    pub failed_component: Option<ComponentKind>,
    pub error: Option<String>,
}

impl BackupManifest {
    pub fn new(artifact_id: Uuid, source: Color, created_at: DateTime<Utc>) -> Self {
        Self {
            artifact_id,
            source,
            created_at,
            entries: Vec::new(),
            complete: false,
            failed_component: None,
            error: None,
        }
    }

    pub fn entry(&self, component: ComponentKind) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.component == component)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

/// Plaintext archive: manifest plus raw component bytes.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub manifest: BackupManifest,
    pub blobs: BTreeMap<ComponentKind, Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct ArchivePayload {
    manifest: BackupManifest,
    blobs: BTreeMap<ComponentKind, String>,
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `MAGIC || nonce || AES-GCM(gzip(json))`.
pub fn seal(contents: &ArchiveContents, cipher: &ArchiveCipher) -> Result<Vec<u8>> {
    let payload = ArchivePayload {
        manifest: contents.manifest.clone(),
        blobs: contents
            .blobs
            .iter()
            .map(|(kind, bytes)| (*kind, Base64::encode_string(bytes)))
            .collect(),
    };
    let json = serde_json::to_vec(&payload)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    let sealed = cipher.encrypt(&compressed, ARCHIVE_MAGIC)?;
    let mut out = Vec::with_capacity(ARCHIVE_MAGIC.len() + sealed.len());
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverses [`seal`]. Any structural problem is a `RestoreIntegrityError`;
/// per-component checksums are left to the caller.
pub fn open(bytes: &[u8], cipher: &ArchiveCipher) -> Result<ArchiveContents> {
    let integrity = |what: String| AppError::RestoreIntegrityError(what);

    if bytes.len() < ARCHIVE_MAGIC.len() || &bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        return Err(integrity("archive does not start with the expected header".to_string()));
    }

    let compressed = cipher
        .decrypt(&bytes[ARCHIVE_MAGIC.len()..], ARCHIVE_MAGIC)
        .map_err(|e| integrity(format!("archive failed authentication: {}", e)))?;

    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| integrity(format!("archive is not valid gzip: {}", e)))?;

    let payload: ArchivePayload =
        serde_json::from_slice(&json).map_err(|e| integrity(format!("archive payload is malformed: {}", e)))?;

    let mut blobs = BTreeMap::new();
    for (kind, encoded) in payload.blobs {
        let decoded = Base64::decode_vec(&encoded)
            .map_err(|e| integrity(format!("{} blob is not valid base64: {}", kind, e)))?;
        blobs.insert(kind, decoded);
    }

    Ok(ArchiveContents {
        manifest: payload.manifest,
        blobs,
    })
}
