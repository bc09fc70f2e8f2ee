use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::PackageArtifact;
use crate::component::{ComponentGraph, RegisterContext};
use crate::descriptor::{
    Descriptor, InstallScope, PackageDecl, SameVersionPolicy, DEFAULT_DOWNGRADE_MESSAGE,
};
use crate::directory::{DirectoryLocation, DirectoryTree};
use crate::error::{BuildError, BuildErrors, EntityKind};
use crate::feature::FeatureTree;
use crate::identity::normalize_guid;
use crate::template::substitute_collecting;
use crate::version::ProductVersion;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageIdentity {
    pub name: String,
    pub manufacturer: String,
    pub upgrade_code: String,
    pub version: ProductVersion,
    pub scope: InstallScope,
    pub same_version: SameVersionPolicy,
    pub downgrade_message: String,
}

impl PackageIdentity {
    pub fn from_decl(declaration: &PackageDecl) -> Result<Self, BuildErrors> {
        let mut errors = BuildErrors::new();

        for (field, value) in [
            ("name", &declaration.name),
            ("manufacturer", &declaration.manufacturer),
        ] {
            if value.trim().is_empty() {
                errors.push(BuildError::schema(
                    format!("package.{field}"),
                    "must not be empty",
                ));
            }
        }

        let upgrade_code = normalize_guid(&declaration.upgrade_code).unwrap_or_else(|| {
            errors.push(BuildError::schema(
                "package.upgrade_code",
                format!("'{}' is not a GUID", declaration.upgrade_code),
            ));
            String::new()
        });

        let version = match ProductVersion::parse(&declaration.version) {
            Ok(version) => Some(version),
            Err(err) => {
                errors.push(err.into());
                None
            }
        };

        let Some(version) = version else {
            return Err(errors);
        };
        errors.into_result(Self {
            name: declaration.name.trim().to_string(),
            manufacturer: declaration.manufacturer.trim().to_string(),
            upgrade_code,
            version,
            scope: declaration.scope,
            same_version: declaration.same_version,
            downgrade_message: declaration
                .downgrade_message
                .clone()
                .unwrap_or_else(|| DEFAULT_DOWNGRADE_MESSAGE.to_string()),
        })
    }
}

/// Content digest recorded for a file's payload at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDigest {
    pub sha256: String,
    pub size: u64,
}

/// The validated, frozen install graph. Once built it is only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "PackageArtifact", try_from = "PackageArtifact")]
pub struct InstallGraph {
    package: PackageIdentity,
    directories: DirectoryTree,
    components: ComponentGraph,
    features: FeatureTree,
}

impl InstallGraph {
    pub(crate) fn from_parts(
        package: PackageIdentity,
        directories: DirectoryTree,
        components: ComponentGraph,
        features: FeatureTree,
    ) -> Self {
        Self {
            package,
            directories,
            components,
            features,
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (PackageIdentity, DirectoryTree, ComponentGraph, FeatureTree) {
        (self.package, self.directories, self.components, self.features)
    }

    pub fn package(&self) -> &PackageIdentity {
        &self.package
    }

    pub fn directories(&self) -> &DirectoryTree {
        &self.directories
    }

    pub fn components(&self) -> &ComponentGraph {
        &self.components
    }

    pub fn features(&self) -> &FeatureTree {
        &self.features
    }

    pub fn location(&self, directory: &str) -> Option<DirectoryLocation> {
        self.directories.location(directory)
    }

    /// Attaches build-time payload digests to every file. Files without a
    /// digest are reported as unresolved sources.
    pub fn seal_payload(
        mut self,
        digests: &BTreeMap<String, PayloadDigest>,
    ) -> Result<Self, BuildErrors> {
        let mut errors = BuildErrors::new();
        for file in self.components.files_mut() {
            match digests.get(&file.id) {
                Some(digest) => {
                    file.sha256 = Some(digest.sha256.clone());
                    file.size = Some(digest.size);
                }
                None => errors.push(BuildError::unresolved(
                    format!("file '{}'", file.id),
                    EntityKind::SourceFile,
                    &file.source,
                )),
            }
        }
        errors.into_result(self)
    }

    pub fn is_sealed(&self) -> bool {
        self.components
            .components()
            .iter()
            .flat_map(|component| &component.files)
            .all(|file| file.sha256.is_some())
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }
}

/// Substitutes placeholders, then validates the whole descriptor and freezes
/// it into an [`InstallGraph`]. Every problem is reported, not just the first.
pub fn compile(descriptor: &Descriptor) -> Result<InstallGraph, BuildErrors> {
    let mut errors = BuildErrors::new();
    let literal = substitute_collecting(descriptor, &mut errors);

    let package = match PackageIdentity::from_decl(&literal.package) {
        Ok(package) => Some(package),
        Err(package_errors) => {
            errors.append(package_errors);
            None
        }
    };

    let directories = DirectoryTree::build_collecting(&literal.directories, &mut errors);

    let mut components = ComponentGraph::new();
    for (index, component) in literal.components.iter().enumerate() {
        let location = format!("components[{index}]");
        if let Err(component_errors) = components.register(
            component,
            RegisterContext {
                location: &location,
                default_directory: None,
                group: None,
            },
            &directories,
        ) {
            errors.append(component_errors);
        }
    }
    for group in &literal.component_groups {
        if let Err(group_errors) = components.register_group(group, &directories) {
            errors.append(group_errors);
        }
    }
    if let Err(edge_errors) = components.validate_references(&directories) {
        errors.append(edge_errors);
    }

    if literal.features.is_empty() && !components.components().is_empty() {
        errors.push(BuildError::schema(
            "features",
            "package declares components but no features",
        ));
    }

    let features = match FeatureTree::build(&literal.features, &components) {
        Ok(features) => {
            let referenced = features.referenced_components(&components);
            for component in components.components() {
                if !referenced.contains(&component.id) {
                    errors.push(BuildError::schema(
                        format!("components['{}']", component.id),
                        "component is not reachable from any feature",
                    ));
                }
            }
            Some(features)
        }
        Err(feature_errors) => {
            errors.append(feature_errors);
            None
        }
    };

    match (package, features) {
        (Some(package), Some(features)) if errors.is_empty() => {
            debug!(
                package = %package.name,
                version = %package.version,
                directories = directories.len(),
                components = components.components().len(),
                "compiled install graph"
            );
            Ok(InstallGraph::from_parts(
                package,
                directories,
                components,
                features,
            ))
        }
        _ => Err(errors),
    }
}
