use anyhow::Result;
use std::collections::BTreeSet;
use tracing::info;

use crate::emitter::{ActionHooks, NoopHooks};
use crate::plan::{ActionOp, PlannedAction};
use crate::receipts::read_product_receipts;
use crate::session::{canonical_upgrade_code, execute_transaction, with_lineage_lock};
use crate::{InstallError, ProductReceipt, SystemLayout, UninstallOutcome};

pub fn uninstall_product(
    layout: &SystemLayout,
    upgrade_code: &str,
) -> Result<UninstallOutcome, InstallError> {
    uninstall_product_with_hooks(layout, upgrade_code, &mut NoopHooks)
}

/// Removes every installed product of the lineage, in every scope.
pub fn uninstall_product_with_hooks(
    layout: &SystemLayout,
    upgrade_code: &str,
    hooks: &mut dyn ActionHooks,
) -> Result<UninstallOutcome, InstallError> {
    let upgrade_code = canonical_upgrade_code(upgrade_code);
    if lineage_receipts(layout, &upgrade_code)?.is_empty() {
        return Ok(UninstallOutcome::NotInstalled { upgrade_code });
    }

    with_lineage_lock(layout, &upgrade_code, |txid| {
        let receipts = lineage_receipts(layout, &upgrade_code)?;
        if receipts.is_empty() {
            return Ok(UninstallOutcome::NotInstalled {
                upgrade_code: upgrade_code.clone(),
            });
        }

        let actions = plan_uninstall(layout, &receipts)?;
        execute_transaction(layout, txid, "uninstall", &upgrade_code, &actions, hooks)?;
        info!(upgrade_code = %upgrade_code, products = receipts.len(), "uninstall committed");
        Ok(UninstallOutcome::Removed {
            products: receipts,
            txid: txid.to_string(),
        })
    })
}

pub(crate) fn lineage_receipts(
    layout: &SystemLayout,
    upgrade_code: &str,
) -> Result<Vec<ProductReceipt>> {
    let wanted = canonical_upgrade_code(upgrade_code);
    Ok(read_product_receipts(layout)?
        .into_iter()
        .filter(|receipt| canonical_upgrade_code(&receipt.upgrade_code) == wanted)
        .collect())
}

/// Recorded resources in reverse install order, then owned directories
/// deepest first, then the receipts.
fn plan_uninstall(layout: &SystemLayout, receipts: &[ProductReceipt]) -> Result<Vec<PlannedAction>> {
    let mut actions = Vec::new();
    let mut seen = BTreeSet::new();
    for receipt in receipts {
        for resource in receipt.resources.iter().rev() {
            if !seen.insert(resource.path.clone()) {
                continue;
            }
            actions.push(PlannedAction::session(ActionOp::RemoveOrphan {
                resource: resource.kind,
                path: layout.from_relative(&resource.path)?,
            }));
        }
    }

    let mut directories = receipts
        .iter()
        .flat_map(|receipt| receipt.directories.iter())
        .map(|dir| layout.from_relative(dir))
        .collect::<Result<BTreeSet<_>>>()?;
    while let Some(dir) = directories.pop_last() {
        actions.push(PlannedAction::session(ActionOp::RemoveEmptyDirectory {
            path: dir,
        }));
    }

    for receipt in receipts {
        actions.push(PlannedAction::session(ActionOp::UnregisterProduct {
            upgrade_code: receipt.upgrade_code.clone(),
            scope: receipt.scope,
            version: receipt.version.clone(),
        }));
    }
    Ok(actions)
}
