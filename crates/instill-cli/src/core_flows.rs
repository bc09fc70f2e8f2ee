use std::fs;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use instill_core::{BuildErrors, Descriptor};
use instill_installer::{
    build_package, doctor_report, install_package_with_hooks, plan_install,
    read_product_receipts, uninstall_product_with_hooks, validate_package, verify_product,
    DoctorReport, InstallError, InstallOutcome, InstallPlan, InstallRequest, KeyPathStatus,
    LoadedPackage, PackageBuildError, ProductHealth, ProductReceipt, RollbackStatus,
    SystemLayout, UninstallOutcome,
};
use tracing::debug;

use crate::render::{render_status_line, OutputStyle, ProgressHooks, TerminalRenderer};

fn read_descriptor(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor: {}", path.display()))
}

fn open_package(path: &Path) -> Result<LoadedPackage> {
    LoadedPackage::open(path).with_context(|| format!("failed to open package: {}", path.display()))
}

pub(crate) fn format_build_error_lines(errors: &BuildErrors, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "err",
        &format!("descriptor has {} error(s)", errors.len()),
    )];
    for error in errors.iter() {
        lines.push(render_status_line(
            style,
            "err",
            &format!("{}: {error}", error.code()),
        ));
    }
    lines
}

fn report_build_errors(errors: &BuildErrors, style: OutputStyle) -> ExitCode {
    TerminalRenderer::from_style(style).print_lines(&format_build_error_lines(errors, style));
    ExitCode::FAILURE
}

pub(crate) fn run_build_command(
    descriptor_path: &Path,
    source: &Path,
    output: &Path,
    style: OutputStyle,
) -> Result<ExitCode> {
    let raw = read_descriptor(descriptor_path)?;
    let descriptor = match Descriptor::from_toml_str(&raw) {
        Ok(descriptor) => descriptor,
        Err(errors) => return Ok(report_build_errors(&errors, style)),
    };

    match build_package(&descriptor, source, output) {
        Ok(built) => {
            let package = built.graph.package();
            let renderer = TerminalRenderer::from_style(style);
            renderer.print_status(
                "ok",
                &format!(
                    "built {} {} ({} blob(s) written)",
                    package.name, package.version, built.blobs_written
                ),
            );
            renderer.print_status(
                "step",
                &format!("manifest: {}", built.manifest_path.display()),
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(PackageBuildError::Invalid(errors)) => Ok(report_build_errors(&errors, style)),
        Err(PackageBuildError::Io(err)) => Err(err),
    }
}

pub(crate) fn run_validate_command(
    descriptor_path: &Path,
    source: Option<&Path>,
    style: OutputStyle,
) -> Result<ExitCode> {
    let raw = read_descriptor(descriptor_path)?;
    let descriptor = match Descriptor::from_toml_str(&raw) {
        Ok(descriptor) => descriptor,
        Err(errors) => return Ok(report_build_errors(&errors, style)),
    };

    match validate_package(&descriptor, source) {
        Ok(graph) => {
            let package = graph.package();
            TerminalRenderer::from_style(style).print_status(
                "ok",
                &format!(
                    "{} {} is valid ({} component(s), {} feature(s))",
                    package.name,
                    package.version,
                    graph.components().components().len(),
                    graph.features().features().len()
                ),
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => Ok(report_build_errors(&errors, style)),
    }
}

pub(crate) fn format_plan_lines(
    plan: &InstallPlan,
    layout: &SystemLayout,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = vec![
        render_status_line(
            style,
            "step",
            &format!(
                "{} {} ({})",
                plan.package.name,
                plan.package.version,
                plan.scope.as_str()
            ),
        ),
        render_status_line(style, "step", &format!("mode: {}", plan.mode())),
    ];

    if let Some(reason) = plan.decision.declined() {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("declined: {reason}"),
        ));
        return lines;
    }

    lines.push(render_status_line(
        style,
        "step",
        &format!("features: {}", plan.selection.features().join(", ")),
    ));
    for (index, action) in plan.actions.iter().enumerate() {
        let owner = action
            .component
            .as_deref()
            .map(|component| format!(" [{component}]"))
            .unwrap_or_default();
        let key_path = if action.key_path { " (key path)" } else { "" };
        lines.push(format!(
            "{:>3}. {}{owner}{key_path}",
            index + 1,
            action.describe(layout)
        ));
    }
    lines
}

pub(crate) fn run_plan_command(
    layout: &SystemLayout,
    package_path: &Path,
    request: &InstallRequest,
    style: OutputStyle,
) -> Result<ExitCode> {
    let package = open_package(package_path)?;
    match plan_install(layout, &package, request) {
        Ok(plan) => {
            TerminalRenderer::from_style(style).print_lines(&format_plan_lines(&plan, layout, style));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            TerminalRenderer::from_style(style)
                .print_lines(&format_install_error_lines("plan", &err, style));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn rollback_line(rollback: &RollbackStatus, style: OutputStyle) -> String {
    match rollback {
        RollbackStatus::Completed { undone } => render_status_line(
            style,
            "ok",
            &format!("rollback: completed ({undone} step(s) undone)"),
        ),
        RollbackStatus::Failed { undone, failures } => render_status_line(
            style,
            "err",
            &format!(
                "rollback: FAILED after {undone} step(s) undone; lineage lock left held ({})",
                failures.join("; ")
            ),
        ),
    }
}

pub(crate) fn format_install_error_lines(
    operation: &str,
    err: &InstallError,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "err",
        &format!("{operation} failed ({}): {err}", err.code()),
    )];
    match err {
        InstallError::ActionFailed {
            action,
            component,
            rollback,
            ..
        } => {
            lines.push(render_status_line(style, "err", &format!("action: {action}")));
            if let Some(component) = component {
                lines.push(render_status_line(
                    style,
                    "err",
                    &format!("component: {component}"),
                ));
            }
            lines.push(rollback_line(rollback, style));
        }
        InstallError::Cancelled { rollback, .. } => lines.push(rollback_line(rollback, style)),
        InstallError::LineageLocked { .. } => lines.push(render_status_line(
            style,
            "warn",
            "another session holds this product's lineage; run `instill doctor` to inspect",
        )),
        InstallError::Scope(_) | InstallError::Selection(_) | InstallError::Other(_) => {}
    }
    lines
}

pub(crate) fn format_install_outcome_lines(
    outcome: &InstallOutcome,
    skipped_reasons: &[(String, String)],
    style: OutputStyle,
) -> Vec<String> {
    match outcome {
        InstallOutcome::Declined { mode, reason } => vec![render_status_line(
            style,
            "warn",
            &format!("declined ({mode}): {reason}"),
        )],
        InstallOutcome::Completed(report) => {
            let receipt = &report.receipt;
            let mut lines = vec![
                render_status_line(
                    style,
                    "ok",
                    &format!(
                        "installed {} {} ({})",
                        receipt.name,
                        receipt.version,
                        report.scope.as_str()
                    ),
                ),
                render_status_line(
                    style,
                    "step",
                    &format!("actions applied: {}", report.actions_applied),
                ),
                render_status_line(style, "step", &format!("transaction: {}", report.txid)),
            ];
            for skipped in &report.skipped {
                let reason = skipped_reasons
                    .iter()
                    .find(|(component, _)| *component == skipped.id)
                    .map(|(_, reason)| reason.as_str())
                    .unwrap_or(skipped.reason.as_str());
                lines.push(render_status_line(
                    style,
                    "warn",
                    &format!("skipped non-vital component '{}': {reason}", skipped.id),
                ));
            }
            lines
        }
    }
}

pub(crate) fn run_install_command(
    layout: &SystemLayout,
    package_path: &Path,
    request: &InstallRequest,
    style: OutputStyle,
) -> Result<ExitCode> {
    let package = open_package(package_path)?;
    let renderer = TerminalRenderer::from_style(style);

    let plan = match plan_install(layout, &package, request) {
        Ok(plan) => plan,
        Err(err) => {
            renderer.print_lines(&format_install_error_lines("install", &err, style));
            return Ok(ExitCode::FAILURE);
        }
    };
    renderer.print_status("step", &format!("mode: {}", plan.mode()));
    debug!(actions = plan.actions.len(), "starting install");

    let mut hooks = ProgressHooks::new(
        renderer.start_progress("install", plan.actions.len() as u64),
        layout,
    );
    let result = install_package_with_hooks(layout, &package, request, &mut hooks);
    let skipped = hooks.finish(result.is_ok());

    match result {
        Ok(outcome) => {
            renderer.print_section("Install");
            renderer.print_lines(&format_install_outcome_lines(&outcome, &skipped, style));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            renderer.print_lines(&format_install_error_lines("install", &err, style));
            Ok(ExitCode::FAILURE)
        }
    }
}

pub(crate) fn format_uninstall_outcome_lines(
    outcome: &UninstallOutcome,
    style: OutputStyle,
) -> Vec<String> {
    match outcome {
        UninstallOutcome::NotInstalled { upgrade_code } => vec![render_status_line(
            style,
            "warn",
            &format!("no installed product has upgrade code {upgrade_code}"),
        )],
        UninstallOutcome::Removed { products, txid } => {
            let mut lines = products
                .iter()
                .map(|receipt| {
                    render_status_line(
                        style,
                        "ok",
                        &format!(
                            "removed {} {} ({})",
                            receipt.name,
                            receipt.version,
                            receipt.scope.as_str()
                        ),
                    )
                })
                .collect::<Vec<_>>();
            lines.push(render_status_line(
                style,
                "step",
                &format!("transaction: {txid}"),
            ));
            lines
        }
    }
}

pub(crate) fn run_uninstall_command(
    layout: &SystemLayout,
    upgrade_code: &str,
    style: OutputStyle,
) -> Result<ExitCode> {
    let renderer = TerminalRenderer::from_style(style);
    let planned = read_product_receipts(layout)?
        .iter()
        .filter(|receipt| {
            receipt
                .upgrade_code
                .eq_ignore_ascii_case(upgrade_code.trim().trim_matches(['{', '}']))
        })
        .map(|receipt| receipt.resources.len() + receipt.directories.len() + 1)
        .sum::<usize>();

    let mut hooks = ProgressHooks::new(renderer.start_progress("uninstall", planned as u64), layout);
    let result = uninstall_product_with_hooks(layout, upgrade_code, &mut hooks);
    hooks.finish(result.is_ok());

    match result {
        Ok(outcome) => {
            renderer.print_lines(&format_uninstall_outcome_lines(&outcome, style));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            renderer.print_lines(&format_install_error_lines("uninstall", &err, style));
            Ok(ExitCode::FAILURE)
        }
    }
}

pub(crate) fn format_list_lines(receipts: &[ProductReceipt]) -> Vec<String> {
    if receipts.is_empty() {
        return vec!["no products installed".to_string()];
    }
    receipts
        .iter()
        .map(|receipt| {
            let skipped = if receipt.skipped_components.is_empty() {
                String::new()
            } else {
                format!(" skipped={}", receipt.skipped_components.join(","))
            };
            format!(
                "{} {} {} upgrade_code={}{skipped}",
                receipt.name,
                receipt.version,
                receipt.scope.as_str(),
                receipt.upgrade_code
            )
        })
        .collect()
}

pub(crate) fn run_list_command(layout: &SystemLayout, style: OutputStyle) -> Result<ExitCode> {
    let receipts = read_product_receipts(layout)?;
    TerminalRenderer::from_style(style).print_lines(&format_list_lines(&receipts));
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn format_verify_lines(products: &[ProductHealth], style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for product in products {
        let status = if product.is_healthy() { "ok" } else { "err" };
        lines.push(render_status_line(
            style,
            status,
            &format!(
                "{} {} ({})",
                product.name,
                product.version,
                product.scope.as_str()
            ),
        ));
        for component in &product.components {
            let status = match component.status {
                KeyPathStatus::Present => "ok",
                KeyPathStatus::Missing => "err",
            };
            lines.push(render_status_line(
                style,
                status,
                &format!(
                    "  {}: {} {}",
                    component.component,
                    component.status.as_str(),
                    component.key_path
                ),
            ));
        }
    }
    lines
}

pub(crate) fn run_verify_command(
    layout: &SystemLayout,
    upgrade_code: &str,
    style: OutputStyle,
) -> Result<ExitCode> {
    let products = verify_product(layout, upgrade_code)?;
    let renderer = TerminalRenderer::from_style(style);
    if products.is_empty() {
        renderer.print_status(
            "err",
            &format!("no installed product has upgrade code {upgrade_code}"),
        );
        return Ok(ExitCode::FAILURE);
    }

    renderer.print_lines(&format_verify_lines(&products, style));
    if products.iter().all(ProductHealth::is_healthy) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

pub(crate) fn format_doctor_lines(report: &DoctorReport, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![
        render_status_line(
            style,
            "step",
            &format!("root: {}", report.root.display()),
        ),
        render_status_line(
            style,
            "step",
            &format!("installed products: {}", report.installed_products),
        ),
    ];

    if report.held_locks.is_empty() {
        lines.push(render_status_line(style, "ok", "lineage locks: none held"));
    }
    for (upgrade_code, holder) in &report.held_locks {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "lineage lock held: {upgrade_code} (txid={})",
                holder.as_deref().unwrap_or("unknown")
            ),
        ));
    }

    if report.unfinished_transactions.is_empty() {
        lines.push(render_status_line(style, "ok", "transactions: healthy"));
    }
    for metadata in &report.unfinished_transactions {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "transaction {} ({} {}): {}",
                metadata.txid,
                metadata.operation,
                metadata.upgrade_code,
                metadata.status.as_str()
            ),
        ));
    }
    lines
}

pub(crate) fn run_doctor_command(layout: &SystemLayout, style: OutputStyle) -> Result<ExitCode> {
    let report = doctor_report(layout)?;
    TerminalRenderer::from_style(style).print_lines(&format_doctor_lines(&report, style));
    Ok(ExitCode::SUCCESS)
}
