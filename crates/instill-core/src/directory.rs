use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::descriptor::DirectoryDecl;
use crate::error::{BuildError, BuildErrors, EntityKind};

/// System locations a package can root its directories under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KnownFolder {
    #[serde(rename = "ProgramFiles64Folder")]
    ProgramFiles64,
    #[serde(rename = "ProgramFilesFolder")]
    ProgramFiles,
    #[serde(rename = "ProgramMenuFolder")]
    ProgramMenu,
    #[serde(rename = "DesktopFolder")]
    Desktop,
    #[serde(rename = "AppDataFolder")]
    AppData,
    #[serde(rename = "LocalAppDataFolder")]
    LocalAppData,
    #[serde(rename = "CommonAppDataFolder")]
    CommonAppData,
}

impl KnownFolder {
    pub const ALL: [KnownFolder; 7] = [
        KnownFolder::ProgramFiles64,
        KnownFolder::ProgramFiles,
        KnownFolder::ProgramMenu,
        KnownFolder::Desktop,
        KnownFolder::AppData,
        KnownFolder::LocalAppData,
        KnownFolder::CommonAppData,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::ProgramFiles64 => "ProgramFiles64Folder",
            Self::ProgramFiles => "ProgramFilesFolder",
            Self::ProgramMenu => "ProgramMenuFolder",
            Self::Desktop => "DesktopFolder",
            Self::AppData => "AppDataFolder",
            Self::LocalAppData => "LocalAppDataFolder",
            Self::CommonAppData => "CommonAppDataFolder",
        }
    }

    pub fn friendly_name(self) -> &'static str {
        match self {
            Self::ProgramFiles64 => "program files (64-bit)",
            Self::ProgramFiles => "program files",
            Self::ProgramMenu => "start menu",
            Self::Desktop => "desktop",
            Self::AppData => "app data",
            Self::LocalAppData => "local app data",
            Self::CommonAppData => "common app data",
        }
    }

    /// Accepts either the folder id or its friendly name, case-insensitively.
    pub fn parse(input: &str) -> Option<Self> {
        let wanted = input.trim();
        Self::ALL.into_iter().find(|folder| {
            folder.id().eq_ignore_ascii_case(wanted)
                || folder.friendly_name().eq_ignore_ascii_case(wanted)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DirectoryParent {
    Known(KnownFolder),
    Directory(String),
}

impl DirectoryParent {
    pub fn id(&self) -> &str {
        match self {
            Self::Known(folder) => folder.id(),
            Self::Directory(id) => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryNode {
    pub id: String,
    pub name: String,
    pub parent: DirectoryParent,
}

/// A directory reference resolved to its well-known root plus the relative
/// path of declared names beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub root: KnownFolder,
    pub relative: PathBuf,
}

/// Install namespace: declared directories hanging off well-known roots.
///
/// Nodes live in an arena and are addressed by id. Parents are placed
/// before their children, and every insertion walks the new node's ancestor
/// chain so a cycle can never be stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryTree {
    nodes: Vec<DirectoryNode>,
    index: BTreeMap<String, usize>,
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(declarations: &[DirectoryDecl]) -> Result<Self, BuildErrors> {
        let mut errors = BuildErrors::new();
        let tree = Self::build_collecting(declarations, &mut errors);
        errors.into_result(tree)
    }

    /// Builds as much of the tree as possible, recording every rejected
    /// declaration in `errors`. Declarations are placed in order, so a parent
    /// must be a well-known root or an earlier declaration.
    pub fn build_collecting(declarations: &[DirectoryDecl], errors: &mut BuildErrors) -> Self {
        let declared = declarations
            .iter()
            .map(|declaration| (declaration.id.trim(), declaration.parent.trim()))
            .collect::<BTreeMap<_, _>>();

        let mut tree = Self::new();
        for declaration in declarations {
            match tree.insert(declaration) {
                Ok(()) => {}
                Err(BuildError::UnresolvedParent { .. }) => {
                    errors.push(unplaced_error(declaration, &declared));
                }
                Err(err) => errors.push(err),
            }
        }
        tree
    }

    /// Rebuilds a tree from frozen nodes, revalidating every insertion.
    pub fn from_nodes(nodes: Vec<DirectoryNode>) -> Result<Self, BuildErrors> {
        let declarations = nodes
            .into_iter()
            .map(|node| DirectoryDecl {
                id: node.id,
                name: node.name,
                parent: node.parent.id().to_string(),
            })
            .collect::<Vec<_>>();
        Self::build(&declarations)
    }

    pub fn insert(&mut self, declaration: &DirectoryDecl) -> Result<(), BuildError> {
        let id = declaration.id.trim();
        if id.is_empty() {
            return Err(BuildError::schema(
                "directories",
                "directory id must not be empty",
            ));
        }
        if declaration.name.trim().is_empty() {
            return Err(BuildError::schema(
                format!("directories['{id}']"),
                "directory name must not be empty",
            ));
        }
        if declaration.name.contains(['/', '\\']) || matches!(declaration.name.trim(), "." | "..")
        {
            return Err(BuildError::schema(
                format!("directories['{id}']"),
                format!(
                    "directory name must be a single path segment: '{}'",
                    declaration.name
                ),
            ));
        }
        if KnownFolder::parse(id).is_some() {
            return Err(BuildError::duplicate(
                EntityKind::Directory,
                id,
                "well-known roots",
            ));
        }

        let parent_ref = declaration.parent.trim();
        if parent_ref == id {
            return Err(BuildError::DirectoryCycle {
                directory: id.to_string(),
                parent: parent_ref.to_string(),
            });
        }

        let parent = if self.index.contains_key(parent_ref) {
            DirectoryParent::Directory(parent_ref.to_string())
        } else if let Some(folder) = KnownFolder::parse(parent_ref) {
            DirectoryParent::Known(folder)
        } else {
            return Err(BuildError::UnresolvedParent {
                directory: id.to_string(),
                parent: parent_ref.to_string(),
            });
        };

        if let DirectoryParent::Directory(parent_id) = &parent {
            if self.ancestor_ids(parent_id).any(|ancestor| ancestor == id) {
                return Err(BuildError::DirectoryCycle {
                    directory: id.to_string(),
                    parent: parent_id.clone(),
                });
            }
        }

        if let Some(existing) = self.get(id) {
            let scope = if existing.parent == parent {
                format!("parent '{}'", parent.id())
            } else {
                "package".to_string()
            };
            return Err(BuildError::duplicate(EntityKind::Directory, id, scope));
        }

        self.index.insert(id.to_string(), self.nodes.len());
        self.nodes.push(DirectoryNode {
            id: id.to_string(),
            name: declaration.name.trim().to_string(),
            parent,
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DirectoryNode> {
        self.index.get(id).map(|idx| &self.nodes[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> &[DirectoryNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Canonical id for a reference to a declared directory or a well-known
    /// root given by id or friendly name.
    pub fn canonical_ref(&self, reference: &str) -> Option<String> {
        let reference = reference.trim();
        if self.contains(reference) {
            return Some(reference.to_string());
        }
        KnownFolder::parse(reference).map(|folder| folder.id().to_string())
    }

    /// Ids from `id` up to (and including) its top-most declared ancestor.
    fn ancestor_ids<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let mut next = self.get(id);
        let mut remaining = self.nodes.len();
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let node = next?;
            next = match &node.parent {
                DirectoryParent::Directory(parent) => self.get(parent),
                DirectoryParent::Known(_) => None,
            };
            Some(node.id.as_str())
        })
    }

    /// Declared nodes from the top-most ancestor down to `id`.
    pub fn chain(&self, id: &str) -> Vec<&DirectoryNode> {
        let mut chain = self
            .ancestor_ids(id)
            .filter_map(|ancestor| self.get(ancestor))
            .collect::<Vec<_>>();
        chain.reverse();
        chain
    }

    pub fn location(&self, reference: &str) -> Option<DirectoryLocation> {
        let reference = reference.trim();
        if let Some(folder) = KnownFolder::parse(reference) {
            if !self.contains(reference) {
                return Some(DirectoryLocation {
                    root: folder,
                    relative: PathBuf::new(),
                });
            }
        }

        let chain = self.chain(reference);
        let top = chain.first()?;
        let DirectoryParent::Known(root) = &top.parent else {
            return None;
        };
        let relative = chain.iter().map(|node| node.name.as_str()).collect();
        Some(DirectoryLocation {
            root: *root,
            relative,
        })
    }
}

/// Error for a declaration whose parent is not in the tree yet: a loop when
/// the declared parent chain leads back to it, otherwise an unresolved parent.
fn unplaced_error(declaration: &DirectoryDecl, declared: &BTreeMap<&str, &str>) -> BuildError {
    let id = declaration.id.trim();
    let parent = declaration.parent.trim();
    let mut cursor = parent;
    for _ in 0..declared.len() {
        if cursor == id {
            return BuildError::DirectoryCycle {
                directory: id.to_string(),
                parent: parent.to_string(),
            };
        }
        match declared.get(cursor) {
            Some(next) => cursor = *next,
            None => break,
        }
    }
    BuildError::UnresolvedParent {
        directory: id.to_string(),
        parent: parent.to_string(),
    }
}
