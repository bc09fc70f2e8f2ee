use anyhow::{anyhow, Context, Result};
use instill_security::verify_sha256_file;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::fs_utils::{is_empty_dir, remove_file_if_exists};
use crate::plan::{path_label, ActionOp, PlannedAction};
use crate::receipts::serialize_receipt;
use crate::transactions::{
    append_transaction_journal_entry, current_unix_timestamp, TransactionJournalEntry,
};
use crate::{InstallError, ProductReceipt, RollbackStatus, SkippedComponent, SystemLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionControl {
    Proceed,
    Cancel,
}

/// Observer of a running session. Returning `Cancel` from `before_action`
/// stops the session and rolls it back; returning an error fails that action.
pub trait ActionHooks {
    fn before_action(&mut self, _index: usize, _action: &PlannedAction) -> Result<ActionControl> {
        Ok(ActionControl::Proceed)
    }

    fn after_action(&mut self, _index: usize, _action: &PlannedAction) {}

    fn component_skipped(&mut self, _component: &str, _reason: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ActionHooks for NoopHooks {}

/// Cancellation flag that can be shared with another thread.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ActionHooks for CancelToken {
    fn before_action(&mut self, _index: usize, _action: &PlannedAction) -> Result<ActionControl> {
        if self.is_cancelled() {
            return Ok(ActionControl::Cancel);
        }
        Ok(ActionControl::Proceed)
    }
}

#[derive(Debug)]
enum UndoStep {
    RemoveFile(PathBuf),
    Restore { path: PathBuf, backup: PathBuf },
    RemoveDirectory(PathBuf),
    RecreateDirectory(PathBuf),
}

#[derive(Debug)]
struct UndoEntry {
    component: Option<String>,
    step: UndoStep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutionReport {
    pub applied: usize,
    pub skipped: Vec<SkippedComponent>,
    pub receipt: Option<ProductReceipt>,
}

/// Applies planned actions in order, recording how to undo each side effect
/// just before making it.
pub(crate) struct Emitter<'a> {
    layout: &'a SystemLayout,
    txid: &'a str,
    staging: PathBuf,
    undo: Vec<UndoEntry>,
    journal_seq: u64,
    backups: u64,
    skipped: Vec<SkippedComponent>,
}

impl<'a> Emitter<'a> {
    pub fn new(layout: &'a SystemLayout, txid: &'a str) -> Self {
        Self {
            layout,
            txid,
            staging: layout.transaction_staging_path(txid),
            undo: Vec::new(),
            journal_seq: 0,
            backups: 0,
            skipped: Vec::new(),
        }
    }

    pub fn run(
        mut self,
        actions: &[PlannedAction],
        hooks: &mut dyn ActionHooks,
    ) -> Result<ExecutionReport, InstallError> {
        let mut applied = 0;
        let mut receipt = None;

        for (index, action) in actions.iter().enumerate() {
            if let Some(component) = &action.component {
                if self.is_skipped(component) {
                    continue;
                }
            }

            let result = match hooks.before_action(index, action) {
                Ok(ActionControl::Cancel) => {
                    info!(action = %action.kind(), "session cancelled");
                    let rollback = self.rollback_all();
                    return Err(InstallError::Cancelled {
                        action: action.describe(self.layout),
                        rollback,
                    });
                }
                Ok(ActionControl::Proceed) => self.apply(action),
                Err(err) => Err(err),
            };

            match result {
                Ok(written) => {
                    applied += 1;
                    if written.is_some() {
                        receipt = written;
                    }
                    hooks.after_action(index, action);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    if let (Some(component), false) = (&action.component, action.vital) {
                        warn!(
                            component = %component,
                            action = %action.kind(),
                            error = %message,
                            "non-vital component failed; skipping it"
                        );
                        match self.undo_component(component) {
                            Ok(()) => {
                                hooks.component_skipped(component, &message);
                                self.skipped.push(SkippedComponent {
                                    id: component.clone(),
                                    reason: message,
                                });
                                continue;
                            }
                            Err(failures) => {
                                let rollback = self.rollback_all();
                                return Err(InstallError::ActionFailed {
                                    action: action.describe(self.layout),
                                    component: Some(component.clone()),
                                    message: format!(
                                        "{message}; undoing the component failed: {}",
                                        failures.join("; ")
                                    ),
                                    rollback,
                                });
                            }
                        }
                    }

                    warn!(action = %action.kind(), error = %message, "action failed; rolling back");
                    let rollback = self.rollback_all();
                    return Err(InstallError::ActionFailed {
                        action: action.describe(self.layout),
                        component: action.component.clone(),
                        message,
                        rollback,
                    });
                }
            }
        }

        Ok(ExecutionReport {
            applied,
            skipped: self.skipped,
            receipt,
        })
    }

    fn is_skipped(&self, component: &str) -> bool {
        self.skipped.iter().any(|skipped| skipped.id == component)
    }

    fn apply(&mut self, action: &PlannedAction) -> Result<Option<ProductReceipt>> {
        let owner = action.component.as_deref();
        let mut written = None;
        match &action.op {
            ActionOp::CreateDirectory { path } => {
                if path.exists() && !path.is_dir() {
                    return Err(anyhow!("{} exists and is not a directory", path.display()));
                }
                self.create_dir_chain(path, owner)?;
            }
            ActionOp::InstallFile {
                source,
                destination,
                sha256,
            } => {
                self.prepare_write(destination, owner)?;
                fs::copy(source, destination).with_context(|| {
                    format!(
                        "failed to copy {} to {}",
                        source.display(),
                        destination.display()
                    )
                })?;
                verify_sha256_file(destination, sha256)?;
            }
            ActionOp::WriteRegistryValue { path, value } => {
                self.prepare_write(path, owner)?;
                fs::write(path, value.as_bytes())
                    .with_context(|| format!("failed to write registry value {}", path.display()))?;
            }
            ActionOp::CreateShortcut { path, record } => {
                self.prepare_write(path, owner)?;
                fs::write(path, record.render())
                    .with_context(|| format!("failed to write shortcut {}", path.display()))?;
            }
            ActionOp::RemoveOrphan { path, .. } => {
                if path.is_dir() {
                    return Err(anyhow!("{} is a directory, expected a file", path.display()));
                }
                if path.exists() {
                    self.move_to_backup(path, owner)?;
                } else {
                    debug!(path = %path.display(), "recorded resource already absent");
                }
            }
            ActionOp::RemoveEmptyDirectory { path } => {
                if path.is_dir() && is_empty_dir(path)? {
                    fs::remove_dir(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                    self.push_undo(owner, UndoStep::RecreateDirectory(path.clone()));
                } else {
                    debug!(path = %path.display(), "directory kept");
                }
            }
            ActionOp::RegisterProduct { receipt, replaced } => {
                let mut receipt = (**receipt).clone();
                for skipped in &self.skipped {
                    receipt.remove_component(&skipped.id);
                    for previous in replaced {
                        let adopted = receipt.adopt_component(previous, &skipped.id, |relative| {
                            self.layout
                                .from_relative(relative)
                                .map(|path| path.exists())
                                .unwrap_or(false)
                        });
                        if adopted > 0 {
                            debug!(
                                component = %skipped.id,
                                version = %previous.version,
                                resources = adopted,
                                "kept previous records for skipped component"
                            );
                        }
                    }
                }
                receipt.directories.retain(|relative| {
                    self.layout
                        .from_relative(relative)
                        .map(|path| path.is_dir())
                        .unwrap_or(false)
                });
                receipt.txid = Some(self.txid.to_string());
                receipt.installed_at_unix = current_unix_timestamp()?;

                let path = self.layout.receipt_path(receipt.scope, &receipt.upgrade_code);
                self.prepare_write(&path, owner)?;
                fs::write(&path, serialize_receipt(&receipt))
                    .with_context(|| format!("failed to write product receipt {}", path.display()))?;
                written = Some(receipt);
            }
            ActionOp::UnregisterProduct {
                upgrade_code,
                scope,
                ..
            } => {
                let path = self.layout.receipt_path(*scope, upgrade_code);
                if path.exists() {
                    self.move_to_backup(&path, owner)?;
                }
            }
        }

        self.journal(action, "done")?;
        Ok(written)
    }

    /// Creates missing parents and arranges for `path` to be restored or
    /// removed on undo.
    fn prepare_write(&mut self, path: &Path, owner: Option<&str>) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_chain(parent, owner)?;
        }
        if path.is_dir() {
            return Err(anyhow!("{} is a directory", path.display()));
        }
        if path.exists() {
            self.move_to_backup(path, owner)?;
        } else {
            self.push_undo(owner, UndoStep::RemoveFile(path.to_path_buf()));
        }
        Ok(())
    }

    fn create_dir_chain(&mut self, path: &Path, owner: Option<&str>) -> Result<()> {
        let missing = path
            .ancestors()
            .take_while(|ancestor| !ancestor.exists())
            .map(Path::to_path_buf)
            .collect::<Vec<_>>();
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
            self.push_undo(owner, UndoStep::RemoveDirectory(dir));
        }
        Ok(())
    }

    fn move_to_backup(&mut self, path: &Path, owner: Option<&str>) -> Result<()> {
        fs::create_dir_all(&self.staging)
            .with_context(|| format!("failed to create {}", self.staging.display()))?;
        self.backups += 1;
        let backup = self.staging.join(format!("backup-{:05}", self.backups));
        fs::rename(path, &backup).with_context(|| {
            format!(
                "failed to back up {} to {}",
                path.display(),
                backup.display()
            )
        })?;
        self.push_undo(
            owner,
            UndoStep::Restore {
                path: path.to_path_buf(),
                backup,
            },
        );
        Ok(())
    }

    fn push_undo(&mut self, owner: Option<&str>, step: UndoStep) {
        self.undo.push(UndoEntry {
            component: owner.map(ToOwned::to_owned),
            step,
        });
    }

    fn journal(&mut self, action: &PlannedAction, state: &str) -> Result<()> {
        self.journal_seq += 1;
        append_transaction_journal_entry(
            self.layout,
            self.txid,
            &TransactionJournalEntry {
                seq: self.journal_seq,
                step: action.kind().as_str().to_string(),
                state: state.to_string(),
                component: action.component.clone(),
                path: Some(path_label(self.layout, &action.target(self.layout))),
            },
        )?;
        Ok(())
    }

    /// Undoes one non-vital component's side effects, leaving everything
    /// else in place.
    fn undo_component(&mut self, component: &str) -> std::result::Result<(), Vec<String>> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.undo)
            .into_iter()
            .partition(|entry| entry.component.as_deref() == Some(component));
        self.undo = rest;

        let failures = mine
            .into_iter()
            .rev()
            .filter_map(|entry| self.undo_step(entry.step).err())
            .map(|err| format!("{err:#}"))
            .collect::<Vec<_>>();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    fn rollback_all(&mut self) -> RollbackStatus {
        let mut undone = 0;
        let mut failures = Vec::new();
        while let Some(entry) = self.undo.pop() {
            match self.undo_step(entry.step) {
                Ok(()) => undone += 1,
                Err(err) => failures.push(format!("{err:#}")),
            }
        }

        self.journal_seq += 1;
        let rollback_entry = TransactionJournalEntry {
            seq: self.journal_seq,
            step: "rollback".to_string(),
            state: if failures.is_empty() {
                "rolled_back".to_string()
            } else {
                "failed".to_string()
            },
            component: None,
            path: None,
        };
        if let Err(err) = append_transaction_journal_entry(self.layout, self.txid, &rollback_entry) {
            warn!(error = %err, "failed to journal rollback");
        }

        if failures.is_empty() {
            info!(undone, "rollback completed");
            RollbackStatus::Completed { undone }
        } else {
            warn!(undone, failures = failures.len(), "rollback incomplete");
            RollbackStatus::Failed { undone, failures }
        }
    }

    fn undo_step(&self, step: UndoStep) -> Result<()> {
        match step {
            UndoStep::RemoveFile(path) => remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove {}", path.display())),
            UndoStep::Restore { path, backup } => {
                remove_file_if_exists(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::rename(&backup, &path).with_context(|| {
                    format!(
                        "failed to restore {} from {}",
                        path.display(),
                        backup.display()
                    )
                })
            }
            UndoStep::RemoveDirectory(path) => {
                if !path.exists() {
                    return Ok(());
                }
                fs::remove_dir(&path)
                    .with_context(|| format!("failed to remove directory {}", path.display()))
            }
            UndoStep::RecreateDirectory(path) => fs::create_dir_all(&path)
                .with_context(|| format!("failed to recreate directory {}", path.display())),
        }
    }
}
