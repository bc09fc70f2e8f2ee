use anyhow::{anyhow, Context, Result};
use instill_core::{InstallGraph, KnownFolder, RegistryRoot, ResolvedScope};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Logical layout of a target system under one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLayout {
    root: PathBuf,
}

impl SystemLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine_dir(&self) -> PathBuf {
        self.root.join("machine")
    }

    pub fn user_dir(&self) -> PathBuf {
        self.root.join("user")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn products_dir(&self) -> PathBuf {
        self.state_dir().join("products")
    }

    pub fn products_scope_dir(&self, scope: ResolvedScope) -> PathBuf {
        self.products_dir().join(scope.as_str())
    }

    pub fn receipt_path(&self, scope: ResolvedScope, upgrade_code: &str) -> PathBuf {
        self.products_scope_dir(scope)
            .join(format!("{upgrade_code}.receipt"))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn lock_path(&self, upgrade_code: &str) -> PathBuf {
        self.locks_dir().join(format!("{upgrade_code}.lock"))
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    /// Concrete location of a well-known folder for the resolved scope.
    pub fn known_folder_path(&self, folder: KnownFolder, scope: ResolvedScope) -> PathBuf {
        let machine = self.machine_dir();
        let user = self.user_dir();
        match (folder, scope) {
            (KnownFolder::ProgramFiles64, ResolvedScope::PerMachine) => machine.join("ProgramFiles"),
            (KnownFolder::ProgramFiles, ResolvedScope::PerMachine) => {
                machine.join("ProgramFilesX86")
            }
            (KnownFolder::ProgramFiles64 | KnownFolder::ProgramFiles, ResolvedScope::PerUser) => {
                user.join("AppData").join("Local").join("Programs")
            }
            (KnownFolder::ProgramMenu, ResolvedScope::PerMachine) => machine
                .join("ProgramData")
                .join("StartMenu")
                .join("Programs"),
            (KnownFolder::ProgramMenu, ResolvedScope::PerUser) => user
                .join("AppData")
                .join("Roaming")
                .join("StartMenu")
                .join("Programs"),
            (KnownFolder::Desktop, ResolvedScope::PerMachine) => {
                machine.join("Public").join("Desktop")
            }
            (KnownFolder::Desktop, ResolvedScope::PerUser) => user.join("Desktop"),
            (KnownFolder::AppData, _) => user.join("AppData").join("Roaming"),
            (KnownFolder::LocalAppData, _) => user.join("AppData").join("Local"),
            (KnownFolder::CommonAppData, _) => machine.join("ProgramData"),
        }
    }

    /// Absolute path of a directory reference from the install graph.
    pub fn directory_path(
        &self,
        graph: &InstallGraph,
        reference: &str,
        scope: ResolvedScope,
    ) -> Result<PathBuf> {
        let location = graph
            .location(reference)
            .ok_or_else(|| anyhow!("directory '{reference}' does not resolve to a location"))?;
        Ok(self
            .known_folder_path(location.root, scope)
            .join(location.relative))
    }

    /// Directory holding values of a registry root. `HKMU` must already be
    /// resolved for a scope.
    pub fn registry_hive_dir(&self, root: RegistryRoot) -> PathBuf {
        self.registry_dir().join(root.as_str())
    }

    /// Root-relative form of `path` with `/` separators, as recorded in
    /// receipts.
    pub fn to_relative(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.root).with_context(|| {
            format!(
                "path {} is outside the system root {}",
                path.display(),
                self.root.display()
            )
        })?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                _ => return Err(anyhow!("unsupported path component in {}", path.display())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Absolute path of a root-relative receipt path. Rejects anything that
    /// would escape the root.
    pub fn from_relative(&self, relative: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in relative.split('/') {
            if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
                return Err(anyhow!("invalid recorded path: {relative}"));
            }
            path.push(part);
        }
        Ok(path)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.products_dir(),
            self.locks_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_system_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows system root")?;
        return Ok(PathBuf::from(app_data).join("Instill").join("system"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve system root")?;
    Ok(PathBuf::from(home).join(".instill").join("system"))
}
