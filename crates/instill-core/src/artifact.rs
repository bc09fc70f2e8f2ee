use serde::{Deserialize, Serialize};

use crate::component::{ComponentGraph, ComponentGroupNode, ComponentNode};
use crate::directory::{DirectoryNode, DirectoryTree};
use crate::error::{BuildError, BuildErrors};
use crate::feature::{FeatureNode, FeatureTree};
use crate::graph::{InstallGraph, PackageIdentity};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const ARTIFACT_MANIFEST_FILE: &str = "package.json";
pub const ARTIFACT_PAYLOAD_DIR: &str = "payload";

/// On-disk shape of a built package's `package.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageArtifact {
    pub format_version: u32,
    pub package: PackageIdentity,
    #[serde(default)]
    pub directories: Vec<DirectoryNode>,
    #[serde(default)]
    pub components: Vec<ComponentNode>,
    #[serde(default)]
    pub component_groups: Vec<ComponentGroupNode>,
    #[serde(default)]
    pub features: Vec<FeatureNode>,
}

impl From<InstallGraph> for PackageArtifact {
    fn from(graph: InstallGraph) -> Self {
        let (package, directories, components, features) = graph.into_parts();
        let (components, component_groups) = components.into_parts();
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            package,
            directories: directories.nodes().to_vec(),
            components,
            component_groups,
            features: features.into_nodes(),
        }
    }
}

impl TryFrom<PackageArtifact> for InstallGraph {
    type Error = BuildErrors;

    fn try_from(artifact: PackageArtifact) -> Result<Self, Self::Error> {
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(BuildError::schema(
                ARTIFACT_MANIFEST_FILE,
                format!(
                    "unsupported package format version {} (expected {})",
                    artifact.format_version, ARTIFACT_FORMAT_VERSION
                ),
            )
            .into());
        }

        let directories = DirectoryTree::from_nodes(artifact.directories)?;
        let components = ComponentGraph::from_nodes(
            artifact.components,
            artifact.component_groups,
            &directories,
        )?;
        let features = FeatureTree::from_nodes(artifact.features, &components)?;
        Ok(InstallGraph::from_parts(
            artifact.package,
            directories,
            components,
            features,
        ))
    }
}
