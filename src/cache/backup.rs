//! Backup and Restore
//!
//! A backup is a JSON snapshot of the newest live record of every key,
//! collected across all reachable nodes. Records are stored exactly as they
//! sit on the backends (base64 of the binary envelope), so encrypted values
//! stay encrypted on disk and a restore needs the same keyring.
//!
//! Restores re-propagate each record through the versioned replicated
//! write: a value written after the backup was taken is never rolled back.
//!
//! Snapshot files are named `cache_backup_<timestamp>.json`; only the newest
//! `max_backups` are kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::bus::EventBus;
use super::entry::Record;
use super::replication::ReplicationManager;
use crate::config::BackupConfig;
use crate::domain::events::CacheEvent;
use crate::error::{Error, Result};

const FILE_PREFIX: &str = "cache_backup_";
const FILE_SUFFIX: &str = ".json";
const FORMAT_VERSION: u32 = 1;

// =============================================================================
// Snapshot Format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    format: u32,
    created_at: DateTime<Utc>,
    generation: u64,
    entries: Vec<BackupEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupEntry {
    key: String,
    /// Base64 of the stored record
    record: String,
}

/// A snapshot file on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub entries: u64,
    pub size_bytes: u64,
}

/// Outcome of a restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: u64,
    /// Entries expired since the backup, or already superseded everywhere
    pub skipped: u64,
    pub failed: u64,
}

// =============================================================================
// Backup Manager
// =============================================================================

/// Writes, prunes and restores snapshot files
pub struct BackupManager {
    config: BackupConfig,
    scan_batch: usize,
    events: EventBus,
}

impl BackupManager {
    pub fn new(config: BackupConfig, scan_batch: usize, events: EventBus) -> Self {
        Self {
            config,
            scan_batch: scan_batch.max(1),
            events,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Take a snapshot now
    #[instrument(skip_all)]
    pub async fn backup(&self, replication: &ReplicationManager) -> Result<BackupInfo> {
        let snapshot = replication.topology().load();
        let mut newest: HashMap<String, Record> = HashMap::new();

        for node in snapshot.nodes() {
            let keys = match node.keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(node = node.id(), error = %e, "Skipping unreachable node in backup");
                    continue;
                }
            };
            for batch in keys.chunks(self.scan_batch) {
                let Ok(values) = node.multi_get(batch).await else {
                    warn!(node = node.id(), "Backup scan interrupted");
                    break;
                };
                for (key, value) in batch.iter().zip(values) {
                    let Some(record) = value.and_then(|b| Record::decode(&b).ok()) else {
                        continue;
                    };
                    if !record.is_live() || record.verify(key).is_err() {
                        continue;
                    }
                    let replace = newest
                        .get(key)
                        .map(|held| held.version() < record.version())
                        .unwrap_or(true);
                    if replace {
                        newest.insert(key.clone(), record);
                    }
                }
            }
        }

        let mut entries: Vec<BackupEntry> = newest
            .into_iter()
            .map(|(key, record)| BackupEntry {
                key,
                record: BASE64.encode(record.encode()),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let created_at = Utc::now();
        let file = BackupFile {
            format: FORMAT_VERSION,
            created_at,
            generation: snapshot.generation(),
            entries,
        };
        let info = self.write_file(&file, created_at).await?;
        self.prune().await;

        info!(file = %info.file_name, entries = info.entries, "Backup completed");
        self.events
            .publish(CacheEvent::backup(info.path.display().to_string(), info.entries));
        Ok(info)
    }

    async fn write_file(&self, file: &BackupFile, created_at: DateTime<Utc>) -> Result<BackupInfo> {
        tokio::fs::create_dir_all(&self.config.directory).await?;

        let file_name = format!(
            "{}{}{}",
            FILE_PREFIX,
            created_at.format("%Y%m%d_%H%M%S%.3f"),
            FILE_SUFFIX
        );
        let path = self.config.directory.join(&file_name);
        let json = serde_json::to_vec_pretty(file)?;

        // Write then rename so a crash never leaves a torn snapshot
        let partial = path.with_extension(format!("{}.partial", uuid::Uuid::new_v4()));
        tokio::fs::write(&partial, &json).await?;
        tokio::fs::rename(&partial, &path).await?;

        Ok(BackupInfo {
            file_name,
            path,
            entries: file.entries.len() as u64,
            size_bytes: json.len() as u64,
        })
    }

    /// Snapshot files, newest first
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut dir = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !(file_name.starts_with(FILE_PREFIX) && file_name.ends_with(FILE_SUFFIX)) {
                continue;
            }
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let entries = match read_file(&entry.path()).await {
                Ok(file) => file.entries.len() as u64,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Unreadable backup file");
                    0
                }
            };
            backups.push(BackupInfo {
                file_name,
                path: entry.path(),
                entries,
                size_bytes,
            });
        }
        // Timestamped names sort chronologically
        backups.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(backups)
    }

    /// Delete snapshots beyond `max_backups`
    async fn prune(&self) {
        let backups = match self.list().await {
            Ok(backups) => backups,
            Err(e) => {
                error!("Error listing backups for cleanup: {}", e);
                return;
            }
        };
        for old in backups.iter().skip(self.config.max_backups.max(1)) {
            match tokio::fs::remove_file(&old.path).await {
                Ok(()) => debug!(file = %old.file_name, "Deleted old backup"),
                Err(e) => warn!(file = %old.file_name, error = %e, "Could not delete old backup"),
            }
        }
    }

    /// Restore the snapshot `file_name` from the backup directory
    #[instrument(skip(self, replication))]
    pub async fn restore(
        &self,
        replication: &ReplicationManager,
        file_name: &str,
    ) -> Result<RestoreReport> {
        if file_name.contains('/') || file_name.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "backup name must be a file name: {}",
                file_name
            )));
        }
        let path = self.config.directory.join(file_name);
        let file = read_file(&path).await?;
        if file.format != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported backup format {}",
                file.format
            )));
        }

        let mut report = RestoreReport::default();
        for entry in file.entries {
            let record = match decode_entry(&entry) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Skipping corrupt backup entry");
                    report.failed += 1;
                    continue;
                }
            };
            if !record.is_live() {
                report.skipped += 1;
                continue;
            }
            match replication.write_record(&entry.key, record, None).await {
                Ok(receipt) if receipt.superseded == receipt.acks => report.skipped += 1,
                Ok(_) => report.restored += 1,
                Err(e) => {
                    debug!(key = %entry.key, error = %e, "Restore write failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            file = file_name,
            restored = report.restored,
            skipped = report.skipped,
            failed = report.failed,
            "Restore completed"
        );
        self.events
            .publish(CacheEvent::restore(path.display().to_string(), report.restored));
        Ok(report)
    }

    /// Take snapshots every `every` until `shutdown` fires
    #[instrument(skip_all, name = "backup_scheduler")]
    pub async fn run(
        self: Arc<Self>,
        replication: Arc<ReplicationManager>,
        every: Duration,
        shutdown: CancellationToken,
    ) {
        info!(interval = ?every, directory = %self.config.directory.display(), "Starting backup scheduler");
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Backup scheduler shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.backup(&replication).await {
                        error!("Error performing backup: {}", e);
                    }
                }
            }
        }
    }
}

async fn read_file(path: &Path) -> Result<BackupFile> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        Error::Io(format!("cannot read backup {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

fn decode_entry(entry: &BackupEntry) -> Result<Record> {
    let raw = BASE64
        .decode(&entry.record)
        .map_err(|e| Error::Serialization(format!("bad base64: {}", e)))?;
    let record = Record::decode(&Bytes::from(raw))?;
    record.verify(&entry.key)?;
    Ok(record)
}
