use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

use crate::SystemLayout;

pub const TRANSACTION_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Planning,
    Applying,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    /// Sessions in this state may have left the system half-changed.
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::Planning | Self::Applying | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub upgrade_code: String,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Another session already holds the lineage lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lineage {upgrade_code} is locked by another session{}", holder_suffix(.holder.as_deref()))]
pub struct LockHeld {
    pub upgrade_code: String,
    pub holder: Option<String>,
}

pub(crate) fn holder_suffix(holder: Option<&str>) -> String {
    holder
        .map(|txid| format!(" (txid={txid})"))
        .unwrap_or_default()
}

/// Exclusive claim on one upgrade code. Released explicitly; a lock that is
/// never released stays on disk for diagnosis.
#[derive(Debug)]
pub struct LineageLock {
    path: PathBuf,
    upgrade_code: String,
    txid: String,
}

impl LineageLock {
    pub fn upgrade_code(&self) -> &str {
        &self.upgrade_code
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path)
            .with_context(|| format!("failed to release lineage lock: {}", self.path.display()))?;
        debug!(upgrade_code = %self.upgrade_code, txid = %self.txid, "released lineage lock");
        Ok(())
    }

    /// Leaves the lock file in place.
    pub fn keep(self) -> PathBuf {
        warn!(
            upgrade_code = %self.upgrade_code,
            path = %self.path.display(),
            "leaving lineage lock held"
        );
        self.path
    }
}

pub fn acquire_lineage_lock(
    layout: &SystemLayout,
    upgrade_code: &str,
    txid: &str,
) -> Result<LineageLock> {
    let path = layout.lock_path(upgrade_code);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let holder = read_lineage_lock(layout, upgrade_code).ok().flatten();
            return Err(LockHeld {
                upgrade_code: upgrade_code.to_string(),
                holder,
            }
            .into());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to claim lineage lock: {}", path.display())
            });
        }
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .with_context(|| format!("failed to write lineage lock: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush lineage lock: {}", path.display()))?;

    debug!(upgrade_code, txid, "acquired lineage lock");
    Ok(LineageLock {
        path,
        upgrade_code: upgrade_code.to_string(),
        txid: txid.to_string(),
    })
}

pub fn read_lineage_lock(layout: &SystemLayout, upgrade_code: &str) -> Result<Option<String>> {
    let path = layout.lock_path(upgrade_code);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lineage lock: {}", path.display()));
        }
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }
    Ok(Some(txid.to_string()))
}

/// Held locks as `(upgrade_code, txid)` pairs.
pub fn list_lineage_locks(layout: &SystemLayout) -> Result<Vec<(String, Option<String>)>> {
    let dir = layout.locks_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut locks = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read locks directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|v| v.to_str()) != Some("lock") {
            continue;
        }
        let Some(upgrade_code) = path.file_stem().and_then(|v| v.to_str()) else {
            continue;
        };
        let holder = read_lineage_lock(layout, upgrade_code)?;
        locks.push((upgrade_code.to_string(), holder));
    }
    locks.sort();
    Ok(locks)
}

static TXID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn new_txid() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    let sequence = TXID_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(format!("tx-{nanos}-{}-{sequence}", std::process::id()))
}

pub fn write_transaction_metadata(
    layout: &SystemLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let staging = layout.transaction_staging_path(&metadata.txid);
    fs::create_dir_all(&staging).with_context(|| {
        format!(
            "failed to create transaction staging dir: {}",
            staging.display()
        )
    })?;

    let mut payload = serde_json::to_string_pretty(metadata)
        .context("failed to serialize transaction metadata")?;
    payload.push('\n');
    fs::write(&path, payload).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &SystemLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn update_transaction_status(
    layout: &SystemLayout,
    txid: &str,
    status: TransactionStatus,
) -> Result<()> {
    let mut metadata = read_transaction_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("transaction metadata not found for '{txid}'"))?;
    metadata.status = status;
    write_transaction_metadata(layout, &metadata)?;
    Ok(())
}

/// All recorded transactions, oldest first.
pub fn list_transactions(layout: &SystemLayout) -> Result<Vec<TransactionMetadata>> {
    let dir = layout.transactions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut transactions = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read transactions directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        let Some(txid) = path.file_stem().and_then(|v| v.to_str()) else {
            continue;
        };
        if let Some(metadata) = read_transaction_metadata(layout, txid)? {
            transactions.push(metadata);
        }
    }
    transactions.sort_by(|a, b| {
        a.started_at_unix
            .cmp(&b.started_at_unix)
            .then_with(|| a.txid.cmp(&b.txid))
    });
    Ok(transactions)
}

pub fn append_transaction_journal_entry(
    layout: &SystemLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut line =
        serde_json::to_string(entry).context("failed to serialize transaction journal entry")?;
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_transaction_journal(
    layout: &SystemLayout,
    txid: &str,
) -> Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()));
        }
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| {
                format!("invalid transaction journal line in {}", path.display())
            })
        })
        .collect()
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
