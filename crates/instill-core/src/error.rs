use std::fmt;

use thiserror::Error;

use crate::version::VersionParseError;

/// Namespace an id lives in, used when reporting duplicate or dangling ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Package,
    Directory,
    Component,
    ComponentGroup,
    ComponentGuid,
    Feature,
    File,
    RegistryValue,
    Shortcut,
    SourceFile,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Directory => "directory",
            Self::Component => "component",
            Self::ComponentGroup => "component group",
            Self::ComponentGuid => "component guid",
            Self::Feature => "feature",
            Self::File => "file",
            Self::RegistryValue => "registry value",
            Self::Shortcut => "shortcut",
            Self::SourceFile => "source file",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{location}: {message}")]
    Schema { location: String, message: String },

    #[error("duplicate {kind} id '{id}' in {scope}")]
    DuplicateId {
        kind: EntityKind,
        id: String,
        scope: String,
    },

    #[error("directory '{directory}' names unknown parent '{parent}'")]
    UnresolvedParent { directory: String, parent: String },

    #[error("directory '{directory}' cannot be placed under '{parent}': ancestor chain loops back to itself")]
    DirectoryCycle { directory: String, parent: String },

    #[error("{owner} references unknown {kind} '{id}'")]
    UnresolvedReference {
        owner: String,
        kind: EntityKind,
        id: String,
    },

    #[error("component '{component}' has no key path item")]
    MissingKeyPath { component: String },

    #[error("component '{component}' marks more than one key path item: {}", items.join(", "))]
    MultipleKeyPath {
        component: String,
        items: Vec<String>,
    },

    #[error(transparent)]
    VersionParse(#[from] VersionParseError),
}

impl BuildError {
    pub fn schema(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn unresolved(owner: impl Into<String>, kind: EntityKind, id: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            owner: owner.into(),
            kind,
            id: id.into(),
        }
    }

    pub fn duplicate(kind: EntityKind, id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::DuplicateId {
            kind,
            id: id.into(),
            scope: scope.into(),
        }
    }

    /// Stable category name, used as the badge in validation reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "SchemaError",
            Self::DuplicateId { .. } => "DuplicateIdError",
            Self::UnresolvedParent { .. } => "UnresolvedParentError",
            Self::DirectoryCycle { .. } => "DirectoryCycleError",
            Self::UnresolvedReference { .. } => "UnresolvedReferenceError",
            Self::MissingKeyPath { .. } => "MissingKeyPathError",
            Self::MultipleKeyPath { .. } => "MultipleKeyPathError",
            Self::VersionParse(_) => "VersionParseError",
        }
    }
}

/// Every build-time problem found in one pass. Builds never stop at the first
/// error, so this is what callers see on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildErrors {
    errors: Vec<BuildError>,
}

impl BuildErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: BuildError) {
        self.errors.push(error);
    }

    pub fn append(&mut self, other: BuildErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BuildError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<BuildError> {
        self.errors
    }

    /// `Ok(value)` when nothing was recorded, the collected list otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, BuildErrors> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<BuildError> for BuildErrors {
    fn from(error: BuildError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl FromIterator<BuildError> for BuildErrors {
    fn from_iter<I: IntoIterator<Item = BuildError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a BuildErrors {
    type Item = &'a BuildError;
    type IntoIter = std::slice::Iter<'a, BuildError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

impl fmt::Display for BuildErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.errors.len();
        write!(
            f,
            "{count} build error{}",
            if count == 1 { "" } else { "s" }
        )?;
        for error in &self.errors {
            write!(f, "\n  [{}] {error}", error.code())?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildErrors {}
