mod artifact;
mod component;
mod descriptor;
mod directory;
mod error;
mod feature;
mod graph;
mod identity;
mod template;
mod version;

pub use artifact::{
    PackageArtifact, ARTIFACT_FORMAT_VERSION, ARTIFACT_MANIFEST_FILE, ARTIFACT_PAYLOAD_DIR,
};
pub use component::{
    ComponentGraph, ComponentGroupNode, ComponentNode, FileEntry, GraphEdge, PayloadRef,
    RegisterContext, RegistryEntry, ShortcutEntry,
};
pub use descriptor::{
    ComponentDecl, ComponentGroupDecl, Descriptor, DirectoryDecl, FeatureDecl,
    FileDecl, InstallScope, PackageDecl, RegistryRoot, RegistryValueDecl, ResolvedScope,
    SameVersionPolicy, ScopeError, ShortcutDecl, DEFAULT_DOWNGRADE_MESSAGE,
};
pub use directory::{DirectoryLocation, DirectoryNode, DirectoryParent, DirectoryTree, KnownFolder};
pub use error::{BuildError, BuildErrors, EntityKind};
pub use feature::{FeatureNode, FeatureSelection, FeatureSelectionError, FeatureTree};
pub use graph::{compile, InstallGraph, PackageIdentity, PayloadDigest};
pub use identity::{derive_component_guid, is_valid_guid, normalize_guid, AUTO_GUID};
pub use template::{has_placeholder, substitute};
pub use version::{compare_versions, ProductVersion, VersionParseError};

#[cfg(test)]
mod tests;
