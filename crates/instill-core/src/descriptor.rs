use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BuildError, BuildErrors};

/// Who an install lands for. `Either` is decided at install time from the
/// privilege context.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstallScope {
    PerUser,
    PerMachine,
    #[default]
    Either,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedScope {
    PerUser,
    PerMachine,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("package requires a per-machine install, which needs an elevated session")]
    ElevationRequired,
}

impl InstallScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerUser => "per-user",
            Self::PerMachine => "per-machine",
            Self::Either => "either",
        }
    }

    pub fn resolve(self, elevated: bool) -> Result<ResolvedScope, ScopeError> {
        match (self, elevated) {
            (Self::PerUser, _) => Ok(ResolvedScope::PerUser),
            (Self::PerMachine, true) => Ok(ResolvedScope::PerMachine),
            (Self::PerMachine, false) => Err(ScopeError::ElevationRequired),
            (Self::Either, true) => Ok(ResolvedScope::PerMachine),
            (Self::Either, false) => Ok(ResolvedScope::PerUser),
        }
    }
}

impl ResolvedScope {
    pub const ALL: [ResolvedScope; 2] = [ResolvedScope::PerUser, ResolvedScope::PerMachine];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerUser => "per-user",
            Self::PerMachine => "per-machine",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "per-user" => Some(Self::PerUser),
            "per-machine" => Some(Self::PerMachine),
            _ => None,
        }
    }
}

/// What to do when the exact same version is already installed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SameVersionPolicy {
    #[default]
    Decline,
    Repair,
}

impl SameVersionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decline => "decline",
            Self::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistryRoot {
    /// Machine hive.
    Hklm,
    /// Current user hive.
    Hkcu,
    /// Machine or user, following the resolved install scope.
    Hkmu,
}

impl RegistryRoot {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hklm => "HKLM",
            Self::Hkcu => "HKCU",
            Self::Hkmu => "HKMU",
        }
    }

    /// Concrete hive for a resolved scope; never returns `Hkmu`.
    pub fn for_scope(self, scope: ResolvedScope) -> Self {
        match (self, scope) {
            (Self::Hkmu, ResolvedScope::PerMachine) => Self::Hklm,
            (Self::Hkmu, ResolvedScope::PerUser) => Self::Hkcu,
            (other, _) => other,
        }
    }
}

pub const DEFAULT_DOWNGRADE_MESSAGE: &str =
    "A newer version of ${package.name} is already installed.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDecl {
    pub name: String,
    pub manufacturer: String,
    pub upgrade_code: String,
    pub version: String,
    #[serde(default)]
    pub scope: InstallScope,
    #[serde(default)]
    pub same_version: SameVersionPolicy,
    pub downgrade_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectoryDecl {
    pub id: String,
    pub name: String,
    pub parent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileDecl {
    pub id: String,
    pub source: String,
    pub name: Option<String>,
    #[serde(default)]
    pub key_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistryValueDecl {
    pub id: String,
    pub root: RegistryRoot,
    pub key: String,
    pub name: Option<String>,
    pub value: String,
    #[serde(default)]
    pub key_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShortcutDecl {
    pub id: String,
    pub name: String,
    pub directory: String,
    pub target: String,
    pub working_directory: String,
    #[serde(default)]
    pub key_path: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ComponentDecl {
    pub id: Option<String>,
    pub guid: Option<String>,
    pub directory: Option<String>,
    #[serde(default = "default_true")]
    pub vital: bool,
    #[serde(default)]
    pub files: Vec<FileDecl>,
    #[serde(default)]
    pub registry_values: Vec<RegistryValueDecl>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ComponentGroupDecl {
    pub id: String,
    pub directory: String,
    #[serde(default)]
    pub components: Vec<ComponentDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FeatureDecl {
    pub id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub component_groups: Vec<String>,
    #[serde(default = "default_true")]
    pub default_selected: bool,
    #[serde(default)]
    pub required: bool,
}

/// Declarative package description as written by the author, before
/// placeholder substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    pub package: PackageDecl,
    #[serde(default)]
    pub directories: Vec<DirectoryDecl>,
    #[serde(default)]
    pub components: Vec<ComponentDecl>,
    #[serde(default)]
    pub component_groups: Vec<ComponentGroupDecl>,
    #[serde(default)]
    pub features: Vec<FeatureDecl>,
}

impl Descriptor {
    pub fn from_toml_str(input: &str) -> Result<Self, BuildErrors> {
        toml::from_str(input).map_err(|err| {
            BuildErrors::from(BuildError::schema(
                "descriptor",
                format!("failed to parse descriptor: {err}"),
            ))
        })
    }

    pub fn all_components_mut(&mut self) -> impl Iterator<Item = &mut ComponentDecl> {
        self.components.iter_mut().chain(
            self.component_groups
                .iter_mut()
                .flat_map(|group| group.components.iter_mut()),
        )
    }
}

impl FileDecl {
    /// Installed file name: explicit `name`, else the source's file name.
    pub fn resolved_name(&self) -> Option<&str> {
        if let Some(name) = &self.name {
            return Some(name.as_str());
        }
        self.source
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
    }
}
