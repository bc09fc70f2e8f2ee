use anyhow::{anyhow, Result};
use instill_core::{
    ComponentNode, FeatureSelection, PackageIdentity, PayloadRef, ResolvedScope,
};
use instill_resolver::{InstallMode, UpgradeDecision};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::bundle::LoadedPackage;
use crate::registry::entry_path;
use crate::shortcuts::{shortcut_path, ShortcutRecord};
use crate::{ComponentRecord, ProductReceipt, ResourceKind, ResourceRecord, SystemLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    CreateDirectory,
    InstallFile,
    WriteRegistryValue,
    CreateShortcut,
    RemoveOrphan,
    RemoveEmptyDirectory,
    RegisterProduct,
    UnregisterProduct,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateDirectory => "CreateDirectory",
            Self::InstallFile => "InstallFile",
            Self::WriteRegistryValue => "WriteRegistryValue",
            Self::CreateShortcut => "CreateShortcut",
            Self::RemoveOrphan => "RemoveOrphan",
            Self::RemoveEmptyDirectory => "RemoveEmptyDirectory",
            Self::RegisterProduct => "RegisterProduct",
            Self::UnregisterProduct => "UnregisterProduct",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOp {
    CreateDirectory {
        path: PathBuf,
    },
    InstallFile {
        source: PathBuf,
        destination: PathBuf,
        sha256: String,
    },
    WriteRegistryValue {
        path: PathBuf,
        value: String,
    },
    CreateShortcut {
        path: PathBuf,
        record: ShortcutRecord,
    },
    RemoveOrphan {
        resource: ResourceKind,
        path: PathBuf,
    },
    RemoveEmptyDirectory {
        path: PathBuf,
    },
    /// `replaced` carries the receipts being superseded, so a component that
    /// is skipped keeps whatever its previous version left on disk.
    RegisterProduct {
        receipt: Box<ProductReceipt>,
        replaced: Vec<ProductReceipt>,
    },
    UnregisterProduct {
        upgrade_code: String,
        scope: ResolvedScope,
        version: String,
    },
}

/// One step of a session. Actions owned by a component carry its id and
/// vital flag; session-level actions are always vital.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub component: Option<String>,
    pub vital: bool,
    pub key_path: bool,
    pub op: ActionOp,
}

impl PlannedAction {
    pub(crate) fn session(op: ActionOp) -> Self {
        Self {
            component: None,
            vital: true,
            key_path: false,
            op,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match &self.op {
            ActionOp::CreateDirectory { .. } => ActionKind::CreateDirectory,
            ActionOp::InstallFile { .. } => ActionKind::InstallFile,
            ActionOp::WriteRegistryValue { .. } => ActionKind::WriteRegistryValue,
            ActionOp::CreateShortcut { .. } => ActionKind::CreateShortcut,
            ActionOp::RemoveOrphan { .. } => ActionKind::RemoveOrphan,
            ActionOp::RemoveEmptyDirectory { .. } => ActionKind::RemoveEmptyDirectory,
            ActionOp::RegisterProduct { .. } => ActionKind::RegisterProduct,
            ActionOp::UnregisterProduct { .. } => ActionKind::UnregisterProduct,
        }
    }

    /// Path on the target system this action changes.
    pub fn target(&self, layout: &SystemLayout) -> PathBuf {
        match &self.op {
            ActionOp::CreateDirectory { path }
            | ActionOp::WriteRegistryValue { path, .. }
            | ActionOp::CreateShortcut { path, .. }
            | ActionOp::RemoveOrphan { path, .. }
            | ActionOp::RemoveEmptyDirectory { path } => path.clone(),
            ActionOp::InstallFile { destination, .. } => destination.clone(),
            ActionOp::RegisterProduct { receipt, .. } => {
                layout.receipt_path(receipt.scope, &receipt.upgrade_code)
            }
            ActionOp::UnregisterProduct {
                upgrade_code,
                scope,
                ..
            } => layout.receipt_path(*scope, upgrade_code),
        }
    }

    pub fn describe(&self, layout: &SystemLayout) -> String {
        format!("{} {}", self.kind(), path_label(layout, &self.target(layout)))
    }
}

/// Everything a session will do, decided without touching the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub package: PackageIdentity,
    pub scope: ResolvedScope,
    pub decision: UpgradeDecision,
    pub selection: FeatureSelection,
    pub actions: Vec<PlannedAction>,
}

impl InstallPlan {
    pub fn mode(&self) -> InstallMode {
        self.decision.mode
    }
}

struct ComponentPlan {
    record: ComponentRecord,
    resources: Vec<ResourceRecord>,
    actions: Vec<PlannedAction>,
}

/// Orders the actions for installing `selection` over the products in
/// `replaced`: cleanup of what only the replaced products carried, then
/// missing directories parents first, then each component with its KeyPath
/// write last, then the product registration.
pub(crate) fn plan_actions(
    layout: &SystemLayout,
    package: &LoadedPackage,
    scope: ResolvedScope,
    selection: &FeatureSelection,
    replaced: &[ProductReceipt],
) -> Result<Vec<PlannedAction>> {
    let graph = package.graph();
    let identity = graph.package();

    let selected = graph
        .features()
        .components_for(selection, graph.components());
    let mut components = Vec::new();
    for component in &selected {
        components.push(plan_component(layout, package, component, scope)?);
    }

    let new_paths = components
        .iter()
        .flat_map(|component| component.resources.iter().map(|r| r.path.clone()))
        .collect::<BTreeSet<_>>();

    let mut needed_dirs = BTreeSet::new();
    for component in &components {
        for resource in &component.resources {
            let path = layout.from_relative(&resource.path)?;
            for ancestor in path.ancestors().skip(1) {
                if ancestor == layout.root() || !ancestor.starts_with(layout.root()) {
                    break;
                }
                needed_dirs.insert(ancestor.to_path_buf());
            }
        }
    }

    let previously_owned = replaced
        .iter()
        .flat_map(|receipt| receipt.directories.iter().cloned())
        .collect::<BTreeSet<_>>();

    let mut actions = Vec::new();

    let mut orphans = BTreeSet::new();
    for receipt in replaced {
        for resource in receipt.resources.iter().rev() {
            if new_paths.contains(&resource.path) || !orphans.insert(resource.path.clone()) {
                continue;
            }
            actions.push(PlannedAction::session(ActionOp::RemoveOrphan {
                resource: resource.kind,
                path: layout.from_relative(&resource.path)?,
            }));
        }
    }
    let needed_rel = needed_dirs
        .iter()
        .map(|dir| layout.to_relative(dir))
        .collect::<Result<BTreeSet<_>>>()?;
    let mut stale_dirs = previously_owned
        .iter()
        .filter(|dir| !needed_rel.contains(*dir))
        .map(|dir| layout.from_relative(dir))
        .collect::<Result<BTreeSet<_>>>()?;
    while let Some(dir) = stale_dirs.pop_last() {
        actions.push(PlannedAction::session(ActionOp::RemoveEmptyDirectory { path: dir }));
    }
    let new_receipt_path = layout.receipt_path(scope, &identity.upgrade_code);
    for receipt in replaced {
        if layout.receipt_path(receipt.scope, &receipt.upgrade_code) == new_receipt_path {
            continue;
        }
        actions.push(PlannedAction::session(ActionOp::UnregisterProduct {
            upgrade_code: receipt.upgrade_code.clone(),
            scope: receipt.scope,
            version: receipt.version.clone(),
        }));
    }

    let mut owned_dirs = BTreeSet::new();
    for dir in &needed_dirs {
        let relative = layout.to_relative(dir)?;
        if !dir.exists() {
            actions.push(PlannedAction::session(ActionOp::CreateDirectory {
                path: dir.clone(),
            }));
            owned_dirs.insert(relative);
        } else if previously_owned.contains(&relative) {
            owned_dirs.insert(relative);
        }
    }

    let mut records = Vec::new();
    let mut resources = Vec::new();
    for component in components {
        records.push(component.record);
        resources.extend(component.resources);
        actions.extend(component.actions);
    }

    actions.push(PlannedAction::session(ActionOp::RegisterProduct {
        receipt: Box::new(ProductReceipt {
            name: identity.name.clone(),
            manufacturer: identity.manufacturer.clone(),
            upgrade_code: identity.upgrade_code.clone(),
            version: identity.version.to_string(),
            scope,
            features: selection.features().to_vec(),
            components: records,
            resources,
            directories: owned_dirs.into_iter().collect(),
            skipped_components: Vec::new(),
            txid: None,
            installed_at_unix: 0,
        }),
        replaced: replaced.to_vec(),
    }));

    debug!(
        upgrade_code = %identity.upgrade_code,
        scope = scope.as_str(),
        actions = actions.len(),
        "planned install actions"
    );
    Ok(actions)
}

fn plan_component(
    layout: &SystemLayout,
    package: &LoadedPackage,
    component: &ComponentNode,
    scope: ResolvedScope,
) -> Result<ComponentPlan> {
    let graph = package.graph();
    let directory = layout.directory_path(graph, &component.directory, scope)?;

    let mut items = Vec::new();
    for item in component.payload() {
        let (kind, path, op) = match item {
            PayloadRef::File(file) => {
                let destination = directory.join(&file.name);
                let sha256 = file
                    .sha256
                    .clone()
                    .ok_or_else(|| anyhow!("file '{}' has no payload digest", file.id))?;
                (
                    ResourceKind::File,
                    destination.clone(),
                    ActionOp::InstallFile {
                        source: package.payload_path(file)?,
                        destination,
                        sha256,
                    },
                )
            }
            PayloadRef::RegistryValue(entry) => {
                let path = entry_path(layout, entry, scope);
                (
                    ResourceKind::RegistryValue,
                    path.clone(),
                    ActionOp::WriteRegistryValue {
                        path,
                        value: entry.value.clone(),
                    },
                )
            }
            PayloadRef::Shortcut(shortcut) => {
                let placed_in = layout.directory_path(graph, &shortcut.directory, scope)?;
                let path = shortcut_path(&placed_in, &shortcut.name);
                let (owner, target) = graph
                    .components()
                    .file(&shortcut.target)
                    .ok_or_else(|| anyhow!("shortcut '{}' targets unknown file", shortcut.id))?;
                let record = ShortcutRecord {
                    target: layout
                        .directory_path(graph, &owner.directory, scope)?
                        .join(&target.name),
                    working_directory: layout.directory_path(
                        graph,
                        &shortcut.working_directory,
                        scope,
                    )?,
                };
                (
                    ResourceKind::Shortcut,
                    path.clone(),
                    ActionOp::CreateShortcut { path, record },
                )
            }
        };
        items.push((item.is_key_path(), kind, path, op));
    }
    items.sort_by_key(|(key_path, ..)| *key_path);

    let key_path = items
        .iter()
        .find(|(key_path, ..)| *key_path)
        .map(|(_, _, path, _)| path.clone())
        .ok_or_else(|| anyhow!("component '{}' has no key path", component.id))?;

    let mut resources = Vec::new();
    let mut actions = Vec::new();
    for (key_path, kind, path, op) in items {
        resources.push(ResourceRecord {
            kind,
            component: component.id.clone(),
            path: layout.to_relative(&path)?,
        });
        actions.push(PlannedAction {
            component: Some(component.id.clone()),
            vital: component.vital,
            key_path,
            op,
        });
    }

    Ok(ComponentPlan {
        record: ComponentRecord {
            id: component.id.clone(),
            guid: component.guid.clone(),
            key_path: layout.to_relative(&key_path)?,
        },
        resources,
        actions,
    })
}

pub(crate) fn path_label(layout: &SystemLayout, path: &Path) -> String {
    layout
        .to_relative(path)
        .unwrap_or_else(|_| path.display().to_string())
}
