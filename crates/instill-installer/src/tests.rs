use super::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use instill_core::{BuildError, Descriptor, EntityKind, FeatureSelectionError, ResolvedScope};
use instill_resolver::{DeclineReason, InstallMode};

use crate::receipts::parse_receipt;
use crate::transactions::write_transaction_metadata;

const UPGRADE_CODE: &str = "8F3C1A52-6B0E-4D7A-9C21-5E4B3A2F1D00";

const EDITOR_TEMPLATE: &str = r#"
[package]
name = "Acme Editor"
manufacturer = "Acme"
upgrade_code = "{8f3c1a52-6b0e-4d7a-9c21-5e4b3a2f1d00}"
version = "@VERSION@"

[[directories]]
id = "INSTALLFOLDER"
name = "${package.name}"
parent = "program files (64-bit)"

[[directories]]
id = "MENUFOLDER"
name = "${package.manufacturer}"
parent = "start menu"

[[components]]
id = "core"
directory = "INSTALLFOLDER"

[[components.files]]
id = "editor_exe"
source = "bin/editor.exe"
key_path = true

[[components.files]]
id = "shared_dll"
source = "lib/shared.dll"

[[components]]
id = "settings"
directory = "INSTALLFOLDER"

[[components.registry_values]]
id = "installed_version"
root = "HKMU"
key = "Software\\${package.manufacturer}\\${package.name}"
name = "Version"
value = "${package.version}"
key_path = true
@LEGACY@
[[components]]
id = "docs"
directory = "INSTALLFOLDER"
vital = false

[[components.files]]
id = "guide"
source = "docs/guide.txt"

[[components.files]]
id = "readme"
source = "docs/README.txt"
key_path = true

[[component_groups]]
id = "menu"
directory = "MENUFOLDER"

[[component_groups.components]]
id = "menu_shortcut"

[[component_groups.components.shortcuts]]
id = "editor_lnk"
name = "${package.name}"
directory = "MENUFOLDER"
target = "editor_exe"
working_directory = "INSTALLFOLDER"
key_path = true

[[features]]
id = "main"
components = ["core", "settings"@LEGACY_REF@]
component_groups = ["menu"]
required = true

[[features]]
id = "documentation"
components = ["docs"]
"#;

const LEGACY_COMPONENT: &str = r#"
[[components]]
id = "legacy"
directory = "INSTALLFOLDER"

[[components.files]]
id = "legacy_dat"
source = "legacy.dat"
key_path = true
"#;

fn editor_toml(version: &str, with_legacy: bool) -> String {
    EDITOR_TEMPLATE
        .replace("@VERSION@", version)
        .replace("@LEGACY@", if with_legacy { LEGACY_COMPONENT } else { "" })
        .replace("@LEGACY_REF@", if with_legacy { ", \"legacy\"" } else { "" })
}

fn write_sources(root: &Path, version: &str) {
    for (relative, content) in [
        ("bin/editor.exe", format!("editor {version}")),
        ("lib/shared.dll", "shared runtime".to_string()),
        ("legacy.dat", "legacy data".to_string()),
        ("docs/guide.txt", "guide".to_string()),
        ("docs/README.txt", format!("readme {version}")),
    ] {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("source has a parent"))
            .expect("must create source dir");
        fs::write(&path, content).expect("must write source file");
    }
}

fn build_from_toml(toml: &str, version: &str) -> LoadedPackage {
    let work = test_dir("package");
    let source = work.join("source");
    write_sources(&source, version);
    let descriptor = Descriptor::from_toml_str(toml).expect("descriptor should parse");
    let output = work.join("out");
    build_package(&descriptor, &source, &output).expect("package should build");
    LoadedPackage::open(&output).expect("package should open")
}

fn editor_package(version: &str, with_legacy: bool) -> LoadedPackage {
    build_from_toml(&editor_toml(version, with_legacy), version)
}

fn install(layout: &SystemLayout, package: &LoadedPackage) -> InstallReport {
    install_with(layout, package, &InstallRequest::default())
}

fn install_with(
    layout: &SystemLayout,
    package: &LoadedPackage,
    request: &InstallRequest,
) -> InstallReport {
    match install_package(layout, package, request).expect("install should succeed") {
        InstallOutcome::Completed(report) => report,
        other => panic!("expected a completed install, got {other:?}"),
    }
}

fn user_install_dir(layout: &SystemLayout) -> PathBuf {
    layout
        .user_dir()
        .join("AppData")
        .join("Local")
        .join("Programs")
        .join("Acme Editor")
}

fn user_registry_value(layout: &SystemLayout) -> PathBuf {
    layout
        .registry_dir()
        .join("HKCU")
        .join("Software")
        .join("Acme")
        .join("Acme Editor")
        .join("Version.value")
}

fn user_shortcut(layout: &SystemLayout) -> PathBuf {
    layout
        .user_dir()
        .join("AppData")
        .join("Roaming")
        .join("StartMenu")
        .join("Programs")
        .join("Acme")
        .join("Acme Editor.lnk")
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("file should be readable")
}

/// Every path under the root with file contents; directories map to `None`.
fn snapshot(root: &Path, include_state: bool) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut entries = BTreeMap::new();
    if root.exists() {
        collect_snapshot(root, root, include_state, &mut entries);
    }
    entries
}

fn collect_snapshot(
    root: &Path,
    dir: &Path,
    include_state: bool,
    entries: &mut BTreeMap<String, Option<Vec<u8>>>,
) {
    for entry in fs::read_dir(dir).expect("must read dir") {
        let path = entry.expect("must read dir entry").path();
        let relative = path
            .strip_prefix(root)
            .expect("entry is inside the root")
            .to_string_lossy()
            .replace('\\', "/");
        if !include_state && relative == "state" {
            continue;
        }
        if path.is_dir() {
            entries.insert(relative, None);
            collect_snapshot(root, &path, include_state, entries);
        } else {
            entries.insert(relative, Some(fs::read(&path).expect("must read file")));
        }
    }
}

struct FailWhen<F> {
    matches: F,
    skipped: Vec<String>,
}

impl<F: Fn(&PlannedAction) -> bool> FailWhen<F> {
    fn new(matches: F) -> Self {
        Self {
            matches,
            skipped: Vec::new(),
        }
    }
}

impl<F: Fn(&PlannedAction) -> bool> ActionHooks for FailWhen<F> {
    fn before_action(&mut self, _index: usize, action: &PlannedAction) -> anyhow::Result<ActionControl> {
        if (self.matches)(action) {
            return Err(anyhow!("injected failure"));
        }
        Ok(ActionControl::Proceed)
    }

    fn component_skipped(&mut self, component: &str, _reason: &str) {
        self.skipped.push(component.to_string());
    }
}

/// Cancels from the outside once `after` actions have been applied.
struct CancelAfter {
    token: CancelToken,
    after: usize,
}

impl ActionHooks for CancelAfter {
    fn before_action(&mut self, index: usize, action: &PlannedAction) -> anyhow::Result<ActionControl> {
        self.token.before_action(index, action)
    }

    fn after_action(&mut self, index: usize, _action: &PlannedAction) {
        if index + 1 >= self.after {
            self.token.cancel();
        }
    }
}

#[test]
fn fresh_install_places_payload_and_registers_product() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);

    let report = install(&layout, &package);
    assert_eq!(report.mode, InstallMode::NoPriorInstall);
    assert_eq!(report.scope, ResolvedScope::PerUser);
    assert!(report.skipped.is_empty());

    let install_dir = user_install_dir(&layout);
    assert_eq!(read(&install_dir.join("editor.exe")), "editor 1.0.0");
    assert_eq!(read(&install_dir.join("shared.dll")), "shared runtime");
    assert_eq!(read(&install_dir.join("README.txt")), "readme 1.0.0");
    assert_eq!(read(&user_registry_value(&layout)), "1.0.0");

    let shortcut = read_shortcut(&user_shortcut(&layout)).expect("shortcut should parse");
    assert_eq!(shortcut.target, install_dir.join("editor.exe"));
    assert_eq!(shortcut.working_directory, install_dir);

    let receipts = read_product_receipts(&layout).expect("must read receipts");
    assert_eq!(receipts, vec![report.receipt.clone()]);
    let receipt = &receipts[0];
    assert_eq!(receipt.upgrade_code, UPGRADE_CODE);
    assert_eq!(receipt.version, "1.0.0");
    assert_eq!(receipt.features, vec!["main", "documentation"]);
    assert_eq!(receipt.txid.as_deref(), Some(report.txid.as_str()));
    let core = receipt
        .components
        .iter()
        .find(|component| component.id == "core")
        .expect("core component recorded");
    assert_eq!(
        core.key_path,
        "user/AppData/Local/Programs/Acme Editor/editor.exe"
    );

    assert!(!layout.lock_path(UPGRADE_CODE).exists());
    assert!(!layout.transaction_staging_path(&report.txid).exists());
    let metadata = read_transaction_metadata(&layout, &report.txid)
        .expect("must read metadata")
        .expect("metadata should exist");
    assert_eq!(metadata.status, TransactionStatus::Committed);
    assert_eq!(metadata.operation, "install");

    let journal = read_transaction_journal(&layout, &report.txid).expect("must read journal");
    assert_eq!(journal.len(), report.actions_applied);
    assert!(journal.iter().all(|entry| entry.state == "done"));
}

#[test]
fn plan_orders_directories_first_and_key_paths_last() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);

    let plan = plan_install(&layout, &package, &InstallRequest::default()).expect("must plan");
    assert_eq!(plan.mode(), InstallMode::NoPriorInstall);
    assert!(!layout.root().exists(), "planning must not touch the system");

    let kinds = plan.actions.iter().map(PlannedAction::kind).collect::<Vec<_>>();
    let first_payload = kinds
        .iter()
        .position(|kind| *kind != ActionKind::CreateDirectory)
        .expect("plan has payload actions");
    assert!(first_payload > 0);
    assert!(kinds[first_payload..]
        .iter()
        .all(|kind| *kind != ActionKind::CreateDirectory));
    assert_eq!(kinds.last(), Some(&ActionKind::RegisterProduct));

    for component in ["core", "settings", "docs", "menu_shortcut"] {
        let owned = plan
            .actions
            .iter()
            .filter(|action| action.component.as_deref() == Some(component))
            .collect::<Vec<_>>();
        assert!(!owned.is_empty(), "{component} has actions");
        let (last, rest) = owned.split_last().expect("at least one action");
        assert!(last.key_path, "{component} ends with its key path");
        assert!(rest.iter().all(|action| !action.key_path));
    }

    let created = plan
        .actions
        .iter()
        .filter(|action| action.kind() == ActionKind::CreateDirectory)
        .map(|action| action.target(&layout))
        .collect::<Vec<_>>();
    for (index, dir) in created.iter().enumerate() {
        if let Some(parent) = dir.parent().filter(|parent| *parent != layout.root()) {
            let parent_index = created
                .iter()
                .position(|candidate| candidate == parent)
                .expect("parent is created too");
            assert!(parent_index < index);
        }
    }
}

#[test]
fn deselected_feature_components_are_not_installed() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);

    let report = install_with(
        &layout,
        &package,
        &InstallRequest {
            exclude_features: vec!["documentation".to_string()],
            ..InstallRequest::default()
        },
    );
    assert_eq!(report.receipt.features, vec!["main"]);
    assert!(!user_install_dir(&layout).join("README.txt").exists());
    assert!(user_install_dir(&layout).join("editor.exe").exists());

    let err = plan_install(
        &layout,
        &package,
        &InstallRequest {
            exclude_features: vec!["main".to_string()],
            ..InstallRequest::default()
        },
    )
    .expect_err("required feature cannot be deselected");
    assert!(matches!(
        err,
        InstallError::Selection(FeatureSelectionError::RequiredFeature(ref id)) if id == "main"
    ));
}

#[test]
fn deselecting_a_shortcut_target_is_rejected_before_any_change() {
    let layout = test_layout();
    let toml = editor_toml("1.0.0", false).replace("target = \"editor_exe\"", "target = \"readme\"");
    let package = build_from_toml(&toml, "1.0.0");

    let err = install_package(
        &layout,
        &package,
        &InstallRequest {
            exclude_features: vec!["documentation".to_string()],
            ..InstallRequest::default()
        },
    )
    .expect_err("shortcut would dangle");
    assert_eq!(err.code(), "FeatureSelectionError");
    assert!(matches!(
        err,
        InstallError::Selection(FeatureSelectionError::UntargetedShortcut { ref component, .. })
            if component == "docs"
    ));
    assert!(snapshot(layout.root(), false).is_empty());
    assert!(!user_shortcut(&layout).exists());

    install(&layout, &package);
    assert!(user_shortcut(&layout).exists());
}

#[test]
fn elevated_session_installs_either_scope_per_machine() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);

    let report = install_with(
        &layout,
        &package,
        &InstallRequest {
            elevated: true,
            ..InstallRequest::default()
        },
    );
    assert_eq!(report.scope, ResolvedScope::PerMachine);
    assert!(layout
        .machine_dir()
        .join("ProgramFiles")
        .join("Acme Editor")
        .join("editor.exe")
        .exists());
    assert!(layout
        .registry_dir()
        .join("HKLM")
        .join("Software")
        .join("Acme")
        .join("Acme Editor")
        .join("Version.value")
        .exists());
    assert!(layout
        .receipt_path(ResolvedScope::PerMachine, UPGRADE_CODE)
        .exists());
}

#[test]
fn per_machine_package_requires_elevation() {
    let layout = test_layout();
    let toml = editor_toml("1.0.0", false).replace(
        "version = \"1.0.0\"\n",
        "version = \"1.0.0\"\nscope = \"per-machine\"\n",
    );
    let package = build_from_toml(&toml, "1.0.0");

    let err = install_package(&layout, &package, &InstallRequest::default())
        .expect_err("unelevated per-machine install must fail");
    assert_eq!(err.code(), "ScopeError");
    assert!(!layout.root().exists());
}

#[test]
fn upgrade_removes_old_only_payload_and_keeps_shared_files() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", true));
    let install_dir = user_install_dir(&layout);
    assert!(install_dir.join("legacy.dat").exists());

    let report = install(&layout, &editor_package("2.0.0", false));
    assert_eq!(report.mode, InstallMode::Upgrade);
    assert!(!install_dir.join("legacy.dat").exists());
    assert_eq!(read(&install_dir.join("shared.dll")), "shared runtime");
    assert_eq!(read(&install_dir.join("editor.exe")), "editor 2.0.0");
    assert_eq!(read(&user_registry_value(&layout)), "2.0.0");

    let receipts = read_product_receipts(&layout).expect("must read receipts");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].version, "2.0.0");
    assert!(receipts[0]
        .components
        .iter()
        .all(|component| component.id != "legacy"));
}

#[test]
fn downgrade_is_declined_and_leaves_system_unchanged() {
    let layout = test_layout();
    install(&layout, &editor_package("2.0.0", false));
    let before = snapshot(layout.root(), true);

    let outcome = install_package(
        &layout,
        &editor_package("1.0.0", false),
        &InstallRequest::default(),
    )
    .expect("downgrade is an outcome, not a failure");
    match outcome {
        InstallOutcome::Declined {
            mode,
            reason: DeclineReason::Downgrade { ref message, .. },
        } => {
            assert_eq!(mode, InstallMode::Downgrade);
            assert_eq!(message, "A newer version of Acme Editor is already installed.");
        }
        other => panic!("expected a declined downgrade, got {other:?}"),
    }

    assert_eq!(snapshot(layout.root(), true), before);
}

#[test]
fn same_version_is_declined_by_default() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    install(&layout, &package);
    let before = snapshot(layout.root(), true);

    let outcome =
        install_package(&layout, &package, &InstallRequest::default()).expect("must resolve");
    let InstallOutcome::Declined { mode, reason } = outcome else {
        panic!("expected a declined install");
    };
    assert_eq!(mode, InstallMode::SameVersion);
    assert_eq!(reason.to_string(), "Acme Editor 1.0.0 is already installed");
    assert_eq!(snapshot(layout.root(), true), before);
}

#[test]
fn same_version_repair_restores_missing_payload() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    install(&layout, &package);

    let exe = user_install_dir(&layout).join("editor.exe");
    fs::remove_file(&exe).expect("must remove key path");
    let health = verify_product(&layout, UPGRADE_CODE).expect("must verify");
    assert!(!health[0].is_healthy());

    let report = install_with(
        &layout,
        &package,
        &InstallRequest {
            repair: true,
            ..InstallRequest::default()
        },
    );
    assert_eq!(report.mode, InstallMode::SameVersion);
    assert_eq!(read(&exe), "editor 1.0.0");
    let health = verify_product(&layout, UPGRADE_CODE).expect("must verify");
    assert!(health[0].is_healthy());
}

#[test]
fn vital_failure_rolls_back_fresh_install() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let mut hooks = FailWhen::new(|action: &PlannedAction| {
        action.kind() == ActionKind::RegisterProduct
    });

    let err = install_package_with_hooks(&layout, &package, &InstallRequest::default(), &mut hooks)
        .expect_err("install must fail");
    assert_eq!(err.code(), "InstallActionFailedError");
    match &err {
        InstallError::ActionFailed {
            action,
            component,
            rollback,
            ..
        } => {
            assert!(action.starts_with("RegisterProduct"), "{action}");
            assert!(component.is_none());
            assert!(rollback.succeeded());
        }
        other => panic!("expected an action failure, got {other:?}"),
    }

    assert!(snapshot(layout.root(), false).is_empty());
    assert!(read_product_receipts(&layout).expect("must read receipts").is_empty());
    assert!(!layout.lock_path(UPGRADE_CODE).exists());
    let transactions = list_transactions(&layout).expect("must list transactions");
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::RolledBack);
}

#[test]
fn vital_component_failure_names_the_component() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let mut hooks = FailWhen::new(|action: &PlannedAction| {
        action.component.as_deref() == Some("core") && action.key_path
    });

    let err = install_package_with_hooks(&layout, &package, &InstallRequest::default(), &mut hooks)
        .expect_err("install must fail");
    let InstallError::ActionFailed {
        component, message, ..
    } = &err
    else {
        panic!("expected an action failure, got {err:?}");
    };
    assert_eq!(component.as_deref(), Some("core"));
    assert!(message.contains("injected failure"));
    assert!(!user_install_dir(&layout).join("shared.dll").exists());
    assert!(snapshot(layout.root(), false).is_empty());
}

#[test]
fn failed_upgrade_restores_previous_version() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", true));
    let before = snapshot(layout.root(), false);
    let receipts_before = read_product_receipts(&layout).expect("must read receipts");

    let mut hooks = FailWhen::new(|action: &PlannedAction| {
        action.kind() == ActionKind::RegisterProduct
    });
    let err = install_package_with_hooks(
        &layout,
        &editor_package("2.0.0", false),
        &InstallRequest::default(),
        &mut hooks,
    )
    .expect_err("upgrade must fail");
    assert!(err.rollback().is_some_and(RollbackStatus::succeeded));

    assert_eq!(snapshot(layout.root(), false), before);
    assert_eq!(
        read_product_receipts(&layout).expect("must read receipts"),
        receipts_before
    );
    assert_eq!(read(&user_install_dir(&layout).join("legacy.dat")), "legacy data");
}

#[test]
fn non_vital_failure_skips_only_that_component() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let mut hooks = FailWhen::new(|action: &PlannedAction| {
        action.component.as_deref() == Some("docs") && action.key_path
    });

    let outcome =
        install_package_with_hooks(&layout, &package, &InstallRequest::default(), &mut hooks)
            .expect("non-vital failure must not fail the install");
    let InstallOutcome::Completed(report) = outcome else {
        panic!("expected a completed install");
    };
    assert_eq!(hooks.skipped, vec!["docs"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].id, "docs");
    assert!(report.skipped[0].reason.contains("injected failure"));

    let install_dir = user_install_dir(&layout);
    assert!(!install_dir.join("guide.txt").exists());
    assert!(!install_dir.join("README.txt").exists());
    assert!(install_dir.join("editor.exe").exists());

    let receipt = &report.receipt;
    assert_eq!(receipt.skipped_components, vec!["docs"]);
    assert!(receipt.components.iter().all(|component| component.id != "docs"));
    assert!(receipt.resources.iter().all(|resource| resource.component != "docs"));
}

#[test]
fn upgrade_with_skipped_component_keeps_tracking_its_previous_files() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", false));

    let mut hooks = FailWhen::new(|action: &PlannedAction| {
        action.component.as_deref() == Some("docs") && action.key_path
    });
    let outcome = install_package_with_hooks(
        &layout,
        &editor_package("2.0.0", false),
        &InstallRequest::default(),
        &mut hooks,
    )
    .expect("non-vital failure must not fail the upgrade");
    let InstallOutcome::Completed(report) = outcome else {
        panic!("expected a completed upgrade");
    };
    assert_eq!(hooks.skipped, vec!["docs"]);

    let install_dir = user_install_dir(&layout);
    assert_eq!(read(&install_dir.join("README.txt")), "readme 1.0.0");
    assert_eq!(read(&install_dir.join("guide.txt")), "guide");
    assert_eq!(read(&install_dir.join("editor.exe")), "editor 2.0.0");

    let receipt = &report.receipt;
    assert_eq!(receipt.version, "2.0.0");
    assert_eq!(receipt.skipped_components, vec!["docs"]);
    let docs_paths = receipt
        .resources
        .iter()
        .filter(|resource| resource.component == "docs")
        .map(|resource| resource.path.rsplit('/').next().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(docs_paths.len(), 2);
    assert!(docs_paths.iter().any(|name| name == "README.txt"));
    assert!(docs_paths.iter().any(|name| name == "guide.txt"));
    assert!(receipt.components.iter().any(|component| component.id == "docs"));

    uninstall_product(&layout, UPGRADE_CODE).expect("uninstall should succeed");
    assert!(snapshot(layout.root(), false).is_empty());
}

#[test]
fn cancellation_rolls_back_like_a_vital_failure() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let mut hooks = CancelAfter {
        token: CancelToken::new(),
        after: 4,
    };

    let err = install_package_with_hooks(&layout, &package, &InstallRequest::default(), &mut hooks)
        .expect_err("cancelled install must fail");
    assert_eq!(err.code(), "InstallCancelled");
    assert!(err.rollback().is_some_and(RollbackStatus::succeeded));
    assert!(hooks.token.is_cancelled());
    assert!(snapshot(layout.root(), false).is_empty());
    assert!(!layout.lock_path(UPGRADE_CODE).exists());
}

#[test]
fn cancel_before_first_action_changes_nothing() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let token = CancelToken::new();
    let mut hooks = token.clone();
    token.cancel();

    let err = install_package_with_hooks(&layout, &package, &InstallRequest::default(), &mut hooks)
        .expect_err("cancelled install must fail");
    assert_eq!(
        err.rollback(),
        Some(&RollbackStatus::Completed { undone: 0 })
    );
    assert!(snapshot(layout.root(), false).is_empty());
}

#[test]
fn held_lineage_lock_blocks_second_session() {
    let layout = test_layout();
    let package = editor_package("1.0.0", false);
    let lock = acquire_lineage_lock(&layout, UPGRADE_CODE, "tx-other").expect("must lock");

    let err = install_package(&layout, &package, &InstallRequest::default())
        .expect_err("locked lineage must block");
    match &err {
        InstallError::LineageLocked {
            upgrade_code,
            holder,
        } => {
            assert_eq!(upgrade_code, UPGRADE_CODE);
            assert_eq!(holder.as_deref(), Some("tx-other"));
        }
        other => panic!("expected a lineage lock error, got {other:?}"),
    }
    assert!(snapshot(layout.root(), false).is_empty());

    lock.release().expect("must release");
    install(&layout, &package);
}

#[test]
fn uninstall_removes_payload_and_receipt() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", true));

    let outcome = uninstall_product(&layout, "{8f3c1a52-6b0e-4d7a-9c21-5e4b3a2f1d00}")
        .expect("uninstall should succeed");
    let UninstallOutcome::Removed { products, txid } = outcome else {
        panic!("expected removed products");
    };
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].version, "1.0.0");

    assert!(snapshot(layout.root(), false).is_empty());
    assert!(read_product_receipts(&layout).expect("must read receipts").is_empty());
    let metadata = read_transaction_metadata(&layout, &txid)
        .expect("must read metadata")
        .expect("metadata should exist");
    assert_eq!(metadata.operation, "uninstall");
    assert_eq!(metadata.status, TransactionStatus::Committed);

    let again = uninstall_product(&layout, UPGRADE_CODE).expect("must resolve");
    assert_eq!(
        again,
        UninstallOutcome::NotInstalled {
            upgrade_code: UPGRADE_CODE.to_string()
        }
    );
}

#[test]
fn uninstall_keeps_directories_holding_foreign_files() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", false));
    let foreign = user_install_dir(&layout).join("user-notes.txt");
    fs::write(&foreign, "mine").expect("must write foreign file");

    uninstall_product(&layout, UPGRADE_CODE).expect("uninstall should succeed");
    assert_eq!(read(&foreign), "mine");
    assert!(!user_install_dir(&layout).join("editor.exe").exists());
    assert!(!user_shortcut(&layout).exists());
}

#[test]
fn verify_reports_missing_key_paths() {
    let layout = test_layout();
    install(&layout, &editor_package("1.0.0", false));
    fs::remove_file(user_registry_value(&layout)).expect("must remove registry value");

    let health = verify_product(&layout, UPGRADE_CODE).expect("must verify");
    assert_eq!(health.len(), 1);
    assert!(!health[0].is_healthy());
    let missing = health[0]
        .components
        .iter()
        .filter(|component| component.status == KeyPathStatus::Missing)
        .map(|component| component.component.as_str())
        .collect::<Vec<_>>();
    assert_eq!(missing, vec!["settings"]);
}

#[test]
fn doctor_reports_held_locks_and_unfinished_transactions() {
    let layout = test_layout();
    let clean = doctor_report(&layout).expect("must inspect");
    assert!(clean.is_clean());
    assert_eq!(clean.installed_products, 0);

    let _lock = acquire_lineage_lock(&layout, UPGRADE_CODE, "tx-stuck").expect("must lock");
    write_transaction_metadata(
        &layout,
        &TransactionMetadata {
            version: 1,
            txid: "tx-stuck".to_string(),
            operation: "install".to_string(),
            upgrade_code: UPGRADE_CODE.to_string(),
            status: TransactionStatus::Applying,
            started_at_unix: 1,
        },
    )
    .expect("must write metadata");

    let report = doctor_report(&layout).expect("must inspect");
    assert!(!report.is_clean());
    assert_eq!(
        report.held_locks,
        vec![(UPGRADE_CODE.to_string(), Some("tx-stuck".to_string()))]
    );
    assert_eq!(report.unfinished_transactions.len(), 1);
    assert_eq!(report.unfinished_transactions[0].txid, "tx-stuck");
}

#[test]
fn build_with_missing_source_reports_it_and_writes_nothing() {
    let work = test_dir("missing-source");
    let source = work.join("source");
    write_sources(&source, "1.0.0");
    fs::remove_file(source.join("lib/shared.dll")).expect("must remove source");
    let descriptor =
        Descriptor::from_toml_str(&editor_toml("1.0.0", false)).expect("descriptor should parse");
    let output = work.join("out");

    let err = build_package(&descriptor, &source, &output).expect_err("build must fail");
    let PackageBuildError::Invalid(errors) = err else {
        panic!("expected validation errors");
    };
    assert!(errors.iter().any(|error| matches!(
        error,
        BuildError::UnresolvedReference { kind: EntityKind::SourceFile, id, .. } if id == "lib/shared.dll"
    )));
    assert!(!output.exists());
}

#[test]
fn open_rejects_tampered_payload() {
    let work = test_dir("tampered");
    let source = work.join("source");
    write_sources(&source, "1.0.0");
    let descriptor =
        Descriptor::from_toml_str(&editor_toml("1.0.0", false)).expect("descriptor should parse");
    let output = work.join("out");
    let built = build_package(&descriptor, &source, &output).expect("package should build");
    assert_eq!(built.blobs_written, 4);

    let exe = built
        .graph
        .components()
        .file("editor_exe")
        .map(|(_, file)| file.clone())
        .expect("exe is in the graph");
    let package = LoadedPackage::open(&built.manifest_path).expect("package should open");
    let blob = package.payload_path(&exe).expect("exe is sealed");
    fs::write(&blob, "tampered").expect("must overwrite blob");

    assert!(LoadedPackage::open(&output).is_err());
}

#[test]
fn receipt_lines_parse_back() {
    let layout = test_layout();
    let report = install(&layout, &editor_package("1.0.0", false));
    let raw = read(&layout.receipt_path(ResolvedScope::PerUser, UPGRADE_CODE));
    assert_eq!(parse_receipt(&raw).expect("must parse"), report.receipt);
}

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "instill-installer-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> SystemLayout {
    SystemLayout::new(test_dir("system"))
}
