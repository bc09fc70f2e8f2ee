use anyhow::anyhow;
use instill_core::{normalize_guid, SameVersionPolicy};
use instill_resolver::{resolve_install_mode, InstalledProduct};
use std::fs;
use tracing::{debug, info, warn};

use crate::bundle::LoadedPackage;
use crate::emitter::{ActionHooks, Emitter, ExecutionReport, NoopHooks};
use crate::plan::{plan_actions, InstallPlan, PlannedAction};
use crate::receipts::read_product_receipts;
use crate::transactions::{
    acquire_lineage_lock, current_unix_timestamp, new_txid, update_transaction_status,
    write_transaction_metadata, LockHeld, TransactionMetadata, TransactionStatus,
    TRANSACTION_METADATA_VERSION,
};
use crate::{InstallError, InstallOutcome, InstallReport, ProductReceipt, SystemLayout};

/// Install-time choices made by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    /// The session runs with administrative rights.
    pub elevated: bool,
    /// Re-assert payload when the same version is installed, whatever the
    /// package's own policy says.
    pub repair: bool,
    pub include_features: Vec<String>,
    pub exclude_features: Vec<String>,
}

/// Resolves scope, features and install mode and orders the actions,
/// reading the system without changing it.
pub fn plan_install(
    layout: &SystemLayout,
    package: &LoadedPackage,
    request: &InstallRequest,
) -> Result<InstallPlan, InstallError> {
    let graph = package.graph();
    let identity = graph.package();
    let scope = identity.scope.resolve(request.elevated)?;
    let selection = graph
        .features()
        .select(
            &request.include_features,
            &request.exclude_features,
            graph.components(),
        )?;

    let receipts = read_product_receipts(layout)?;
    let installed = receipts
        .iter()
        .map(ProductReceipt::installed_product)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let policy = if request.repair {
        SameVersionPolicy::Repair
    } else {
        identity.same_version
    };
    let decision = resolve_install_mode(identity, &installed, policy);

    let actions = if decision.proceeds() {
        let replaced = receipts
            .into_iter()
            .filter(|receipt| is_replaced(receipt, decision.replaced()))
            .collect::<Vec<_>>();
        plan_actions(layout, package, scope, &selection, &replaced)?
    } else {
        Vec::new()
    };

    debug!(
        upgrade_code = %identity.upgrade_code,
        mode = %decision.mode,
        scope = scope.as_str(),
        actions = actions.len(),
        "planned install"
    );
    Ok(InstallPlan {
        package: identity.clone(),
        scope,
        decision,
        selection,
        actions,
    })
}

fn is_replaced(receipt: &ProductReceipt, replaced: &[InstalledProduct]) -> bool {
    let code = canonical_upgrade_code(&receipt.upgrade_code);
    replaced.iter().any(|product| {
        product.scope == receipt.scope && canonical_upgrade_code(&product.upgrade_code) == code
    })
}

pub(crate) fn canonical_upgrade_code(code: &str) -> String {
    normalize_guid(code).unwrap_or_else(|| code.trim().to_ascii_uppercase())
}

pub fn install_package(
    layout: &SystemLayout,
    package: &LoadedPackage,
    request: &InstallRequest,
) -> Result<InstallOutcome, InstallError> {
    install_package_with_hooks(layout, package, request, &mut NoopHooks)
}

/// Installs `package`. A declined session returns before anything on the
/// system is touched, lineage lock included.
pub fn install_package_with_hooks(
    layout: &SystemLayout,
    package: &LoadedPackage,
    request: &InstallRequest,
    hooks: &mut dyn ActionHooks,
) -> Result<InstallOutcome, InstallError> {
    let plan = plan_install(layout, package, request)?;
    if let Some(reason) = plan.decision.declined() {
        info!(mode = %plan.mode(), reason = %reason, "install declined");
        return Ok(InstallOutcome::Declined {
            mode: plan.mode(),
            reason: reason.clone(),
        });
    }

    let upgrade_code = plan.package.upgrade_code.clone();
    with_lineage_lock(layout, &upgrade_code, |txid| {
        // Another session may have changed the lineage before the lock was taken.
        let plan = plan_install(layout, package, request)?;
        if let Some(reason) = plan.decision.declined() {
            info!(mode = %plan.mode(), reason = %reason, "install declined");
            return Ok(InstallOutcome::Declined {
                mode: plan.mode(),
                reason: reason.clone(),
            });
        }

        let report =
            execute_transaction(layout, txid, "install", &upgrade_code, &plan.actions, hooks)?;
        let receipt = report
            .receipt
            .ok_or_else(|| anyhow!("install session finished without registering the product"))?;
        info!(
            upgrade_code = %upgrade_code,
            mode = %plan.mode(),
            version = %receipt.version,
            skipped = report.skipped.len(),
            "install committed"
        );
        Ok(InstallOutcome::Completed(InstallReport {
            mode: plan.mode(),
            scope: plan.scope,
            receipt,
            skipped: report.skipped,
            actions_applied: report.applied,
            txid: txid.to_string(),
        }))
    })
}

/// Runs `run` while holding the lineage lock of `upgrade_code`. The lock is
/// left in place when a rollback did not complete.
pub(crate) fn with_lineage_lock<T, F>(
    layout: &SystemLayout,
    upgrade_code: &str,
    run: F,
) -> Result<T, InstallError>
where
    F: FnOnce(&str) -> Result<T, InstallError>,
{
    layout.ensure_base_dirs()?;
    let txid = new_txid()?;
    let lock = acquire_lineage_lock(layout, upgrade_code, &txid).map_err(lock_error)?;

    let result = run(&txid);
    let rollback_failed = matches!(
        &result,
        Err(err) if err.rollback().is_some_and(|rollback| !rollback.succeeded())
    );
    if rollback_failed {
        lock.keep();
    } else if let Err(err) = lock.release() {
        warn!(upgrade_code, error = %err, "failed to release lineage lock");
    }
    result
}

fn lock_error(err: anyhow::Error) -> InstallError {
    match err.downcast_ref::<LockHeld>() {
        Some(held) => InstallError::LineageLocked {
            upgrade_code: held.upgrade_code.clone(),
            holder: held.holder.clone(),
        },
        None => InstallError::Other(err),
    }
}

/// Applies `actions` as one recorded transaction.
pub(crate) fn execute_transaction(
    layout: &SystemLayout,
    txid: &str,
    operation: &str,
    upgrade_code: &str,
    actions: &[PlannedAction],
    hooks: &mut dyn ActionHooks,
) -> Result<ExecutionReport, InstallError> {
    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: TRANSACTION_METADATA_VERSION,
            txid: txid.to_string(),
            operation: operation.to_string(),
            upgrade_code: upgrade_code.to_string(),
            status: TransactionStatus::Planning,
            started_at_unix: current_unix_timestamp()?,
        },
    )?;
    update_transaction_status(layout, txid, TransactionStatus::Applying)?;

    let result = Emitter::new(layout, txid).run(actions, hooks);
    let status = match &result {
        Ok(_) => TransactionStatus::Committed,
        Err(err) => match err.rollback() {
            Some(rollback) if rollback.succeeded() => TransactionStatus::RolledBack,
            _ => TransactionStatus::Failed,
        },
    };
    if let Err(err) = update_transaction_status(layout, txid, status) {
        warn!(txid, status = status.as_str(), error = %err, "failed to record transaction status");
    }

    // Backups stay around when rollback could not finish.
    if status != TransactionStatus::Failed {
        let staging = layout.transaction_staging_path(txid);
        if staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(txid, path = %staging.display(), error = %err, "failed to clean transaction staging");
            }
        }
    }

    debug!(txid, operation, status = status.as_str(), "transaction finished");
    result
}
