use std::fmt;

use instill_core::{ProductVersion, ResolvedScope};

/// A product recorded on the target system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProduct {
    pub name: String,
    pub upgrade_code: String,
    pub version: ProductVersion,
    pub scope: ResolvedScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    NoPriorInstall,
    SameVersion,
    Upgrade,
    Downgrade,
}

impl InstallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPriorInstall => "NoPriorInstall",
            Self::SameVersion => "SameVersion",
            Self::Upgrade => "Upgrade",
            Self::Downgrade => "Downgrade",
        }
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ends without touching the system. Not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclineReason {
    AlreadyInstalled {
        name: String,
        version: ProductVersion,
    },
    Downgrade {
        installed: ProductVersion,
        target: ProductVersion,
        message: String,
    },
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled { name, version } => {
                write!(f, "{name} {version} is already installed")
            }
            Self::Downgrade { message, .. } => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    FreshInstall,
    /// Install the target, then remove what only the superseded products
    /// carried.
    Upgrade { superseded: Vec<InstalledProduct> },
    /// Re-assert every payload item of the already installed version.
    Repair { existing: Vec<InstalledProduct> },
    Decline(DeclineReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeDecision {
    pub mode: InstallMode,
    pub action: ResolvedAction,
    /// Installed products sharing the upgrade code, highest version first.
    pub related: Vec<InstalledProduct>,
}

impl UpgradeDecision {
    pub fn proceeds(&self) -> bool {
        !matches!(self.action, ResolvedAction::Decline(_))
    }

    pub fn declined(&self) -> Option<&DeclineReason> {
        match &self.action {
            ResolvedAction::Decline(reason) => Some(reason),
            _ => None,
        }
    }

    /// Installed products whose receipts the session replaces.
    pub fn replaced(&self) -> &[InstalledProduct] {
        match &self.action {
            ResolvedAction::Upgrade { superseded } => superseded,
            ResolvedAction::Repair { existing } => existing,
            ResolvedAction::FreshInstall | ResolvedAction::Decline(_) => &[],
        }
    }
}
