use std::fmt;

use instill_core::{FeatureSelectionError, ScopeError};
use thiserror::Error;

use crate::transactions::holder_suffix;

/// How the undo log fared after a failed or cancelled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    Completed { undone: usize },
    Failed { undone: usize, failures: Vec<String> },
}

impl RollbackStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { undone } => write!(f, "rollback completed ({undone} step(s) undone)"),
            Self::Failed { undone, failures } => write!(
                f,
                "rollback failed after undoing {undone} step(s): {}",
                failures.join("; ")
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("lineage {upgrade_code} is locked by another session{}", holder_suffix(.holder.as_deref()))]
    LineageLocked {
        upgrade_code: String,
        holder: Option<String>,
    },

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Selection(#[from] FeatureSelectionError),

    #[error("action {action} failed{}: {message}; {rollback}", .component.as_deref().map(|id| format!(" in component '{id}'")).unwrap_or_default())]
    ActionFailed {
        action: String,
        component: Option<String>,
        message: String,
        rollback: RollbackStatus,
    },

    #[error("install cancelled before {action}; {rollback}")]
    Cancelled {
        action: String,
        rollback: RollbackStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InstallError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LineageLocked { .. } => "LineageLocked",
            Self::Scope(_) => "ScopeError",
            Self::Selection(_) => "FeatureSelectionError",
            Self::ActionFailed { .. } => "InstallActionFailedError",
            Self::Cancelled { .. } => "InstallCancelled",
            Self::Other(_) => "InstallError",
        }
    }

    pub fn rollback(&self) -> Option<&RollbackStatus> {
        match self {
            Self::ActionFailed { rollback, .. } | Self::Cancelled { rollback, .. } => {
                Some(rollback)
            }
            _ => None,
        }
    }
}
