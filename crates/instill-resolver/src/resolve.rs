use std::cmp::Ordering;

use instill_core::{normalize_guid, PackageIdentity, SameVersionPolicy};
use tracing::debug;

use crate::types::{
    DeclineReason, InstallMode, InstalledProduct, ResolvedAction, UpgradeDecision,
};

/// Installed products of the lineage identified by `upgrade_code`, highest
/// version first. Codes compare in canonical GUID form.
pub fn find_related_products(
    upgrade_code: &str,
    installed: &[InstalledProduct],
) -> Vec<InstalledProduct> {
    let wanted = canonical_code(upgrade_code);
    let mut related = installed
        .iter()
        .filter(|product| canonical_code(&product.upgrade_code) == wanted)
        .cloned()
        .collect::<Vec<_>>();
    related.sort_by(|a, b| {
        b.version
            .cmp(&a.version)
            .then_with(|| a.scope.cmp(&b.scope))
    });
    related
}

fn canonical_code(code: &str) -> String {
    normalize_guid(code).unwrap_or_else(|| code.trim().to_ascii_uppercase())
}

/// Decides how a package relates to what is installed. `same_version` is the
/// effective policy for an equal version, after any caller override.
///
/// The highest installed version of the lineage decides the mode.
pub fn resolve_install_mode(
    package: &PackageIdentity,
    installed: &[InstalledProduct],
    same_version: SameVersionPolicy,
) -> UpgradeDecision {
    let related = find_related_products(&package.upgrade_code, installed);

    let (mode, action) = match related.first() {
        None => (InstallMode::NoPriorInstall, ResolvedAction::FreshInstall),
        Some(highest) => match highest.version.cmp(&package.version) {
            Ordering::Less => (
                InstallMode::Upgrade,
                ResolvedAction::Upgrade {
                    superseded: related.clone(),
                },
            ),
            Ordering::Equal => match same_version {
                SameVersionPolicy::Decline => (
                    InstallMode::SameVersion,
                    ResolvedAction::Decline(DeclineReason::AlreadyInstalled {
                        name: package.name.clone(),
                        version: highest.version.clone(),
                    }),
                ),
                SameVersionPolicy::Repair => (
                    InstallMode::SameVersion,
                    ResolvedAction::Repair {
                        existing: related.clone(),
                    },
                ),
            },
            Ordering::Greater => (
                InstallMode::Downgrade,
                ResolvedAction::Decline(DeclineReason::Downgrade {
                    installed: highest.version.clone(),
                    target: package.version.clone(),
                    message: package.downgrade_message.clone(),
                }),
            ),
        },
    };

    debug!(
        upgrade_code = %package.upgrade_code,
        target = %package.version,
        related = related.len(),
        mode = %mode,
        "resolved install mode"
    );
    UpgradeDecision {
        mode,
        action,
        related,
    }
}
