use anyhow::{anyhow, Context, Result};
use instill_core::{ProductVersion, ResolvedScope};
use instill_resolver::{DeclineReason, InstallMode, InstalledProduct};

/// What kind of system resource a receipt line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    File,
    RegistryValue,
    Shortcut,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::RegistryValue => "registry",
            Self::Shortcut => "shortcut",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "file" => Ok(Self::File),
            "registry" => Ok(Self::RegistryValue),
            "shortcut" => Ok(Self::Shortcut),
            _ => Err(anyhow!("unknown resource kind: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    pub id: String,
    pub guid: String,
    /// Root-relative path of the component's KeyPath resource.
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub component: String,
    /// Root-relative path.
    pub path: String,
}

/// Installed-product record kept under `state/products/<scope>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductReceipt {
    pub name: String,
    pub manufacturer: String,
    pub upgrade_code: String,
    pub version: String,
    pub scope: ResolvedScope,
    pub features: Vec<String>,
    pub components: Vec<ComponentRecord>,
    pub resources: Vec<ResourceRecord>,
    /// Root-relative directories the product owns, parents first.
    pub directories: Vec<String>,
    pub skipped_components: Vec<String>,
    pub txid: Option<String>,
    pub installed_at_unix: u64,
}

impl ProductReceipt {
    pub fn installed_product(&self) -> Result<InstalledProduct> {
        let version = ProductVersion::parse(&self.version).with_context(|| {
            format!(
                "receipt for {} has an invalid version '{}'",
                self.upgrade_code, self.version
            )
        })?;
        Ok(InstalledProduct {
            name: self.name.clone(),
            upgrade_code: self.upgrade_code.clone(),
            version,
            scope: self.scope,
        })
    }

    /// Drops a component that did not make it onto the system.
    pub fn remove_component(&mut self, id: &str) {
        self.components.retain(|component| component.id != id);
        self.resources.retain(|resource| resource.component != id);
        if !self.skipped_components.iter().any(|skipped| skipped == id) {
            self.skipped_components.push(id.to_string());
        }
    }

    /// Takes over the records `previous` kept for component `id` whose paths
    /// are still on disk and not already tracked here. Returns how many
    /// resources were taken over.
    pub fn adopt_component(
        &mut self,
        previous: &ProductReceipt,
        id: &str,
        still_present: impl Fn(&str) -> bool,
    ) -> usize {
        let adopted = previous
            .resources
            .iter()
            .filter(|resource| resource.component == id)
            .filter(|resource| !self.resources.iter().any(|kept| kept.path == resource.path))
            .filter(|resource| still_present(resource.path.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if adopted.is_empty() {
            return 0;
        }

        if !self.components.iter().any(|component| component.id == id) {
            if let Some(record) = previous.components.iter().find(|record| record.id == id) {
                self.components.push(record.clone());
            }
        }
        let count = adopted.len();
        self.resources.extend(adopted);
        count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedComponent {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub mode: InstallMode,
    pub scope: ResolvedScope,
    pub receipt: ProductReceipt,
    pub skipped: Vec<SkippedComponent>,
    pub actions_applied: usize,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed(InstallReport),
    /// Resolution declined the session; nothing on the system changed.
    Declined {
        mode: InstallMode,
        reason: DeclineReason,
    },
}

impl InstallOutcome {
    pub fn mode(&self) -> InstallMode {
        match self {
            Self::Completed(report) => report.mode,
            Self::Declined { mode, .. } => *mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallOutcome {
    NotInstalled {
        upgrade_code: String,
    },
    Removed {
        products: Vec<ProductReceipt>,
        txid: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPathStatus {
    Present,
    Missing,
}

impl KeyPathStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    pub component: String,
    pub key_path: String,
    pub status: KeyPathStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductHealth {
    pub name: String,
    pub version: String,
    pub scope: ResolvedScope,
    pub components: Vec<ComponentHealth>,
}

impl ProductHealth {
    pub fn is_healthy(&self) -> bool {
        self.components
            .iter()
            .all(|component| component.status == KeyPathStatus::Present)
    }
}
