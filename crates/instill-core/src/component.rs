use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::{ComponentDecl, ComponentGroupDecl, RegistryRoot};
use crate::directory::DirectoryTree;
use crate::error::{BuildError, BuildErrors, EntityKind};
use crate::identity::{derive_component_guid, normalize_guid, AUTO_GUID};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub key_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub id: String,
    pub root: RegistryRoot,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub value: String,
    #[serde(default)]
    pub key_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShortcutEntry {
    pub id: String,
    pub name: String,
    pub directory: String,
    pub target: String,
    pub working_directory: String,
    #[serde(default)]
    pub key_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentNode {
    pub id: String,
    pub guid: String,
    pub directory: String,
    pub vital: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub registry_values: Vec<RegistryEntry>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRef<'a> {
    File(&'a FileEntry),
    RegistryValue(&'a RegistryEntry),
    Shortcut(&'a ShortcutEntry),
}

impl PayloadRef<'_> {
    pub fn id(&self) -> &str {
        match self {
            Self::File(file) => &file.id,
            Self::RegistryValue(value) => &value.id,
            Self::Shortcut(shortcut) => &shortcut.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::File(_) => EntityKind::File,
            Self::RegistryValue(_) => EntityKind::RegistryValue,
            Self::Shortcut(_) => EntityKind::Shortcut,
        }
    }

    pub fn is_key_path(&self) -> bool {
        match self {
            Self::File(file) => file.key_path,
            Self::RegistryValue(value) => value.key_path,
            Self::Shortcut(shortcut) => shortcut.key_path,
        }
    }

    /// Stable description of what this item puts on the system.
    pub fn identity(&self) -> String {
        match self {
            Self::File(file) => format!("file:{}:{}", file.id, file.name),
            Self::RegistryValue(value) => format!(
                "registry:{}:{}:{}",
                value.root.as_str(),
                value.key,
                value.name.as_deref().unwrap_or("")
            ),
            Self::Shortcut(shortcut) => {
                format!("shortcut:{}:{}:{}", shortcut.id, shortcut.directory, shortcut.name)
            }
        }
    }
}

impl ComponentNode {
    pub fn payload(&self) -> impl Iterator<Item = PayloadRef<'_>> {
        self.files
            .iter()
            .map(PayloadRef::File)
            .chain(self.registry_values.iter().map(PayloadRef::RegistryValue))
            .chain(self.shortcuts.iter().map(PayloadRef::Shortcut))
    }

    pub fn key_path(&self) -> Option<PayloadRef<'_>> {
        self.payload().find(PayloadRef::is_key_path)
    }

    fn key_path_error(&self) -> Option<BuildError> {
        key_path_error(
            &self.id,
            self.payload()
                .filter(PayloadRef::is_key_path)
                .map(|item| item.id().to_string())
                .collect(),
        )
    }
}

fn key_path_error(component: &str, key_items: Vec<String>) -> Option<BuildError> {
    match key_items.len() {
        0 => Some(BuildError::MissingKeyPath {
            component: component.to_string(),
        }),
        1 => None,
        _ => Some(BuildError::MultipleKeyPath {
            component: component.to_string(),
            items: key_items,
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentGroupNode {
    pub id: String,
    pub directory: String,
    pub components: Vec<String>,
}

/// Where a component declaration came from, for defaults and error messages.
#[derive(Debug, Clone, Copy)]
pub struct RegisterContext<'a> {
    pub location: &'a str,
    pub default_directory: Option<&'a str>,
    pub group: Option<&'a str>,
}

/// One reference from a payload item to another entity, checked after every
/// component is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub owner: String,
    pub kind: EntityKind,
    pub target: String,
}

/// Registered components and groups, addressed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentGraph {
    components: Vec<ComponentNode>,
    index: BTreeMap<String, usize>,
    groups: Vec<ComponentGroupNode>,
    group_index: BTreeMap<String, usize>,
    guids: BTreeMap<String, String>,
    payload: BTreeMap<String, (EntityKind, String)>,
    /// Resolved install destination of every file and shortcut, keyed
    /// case-insensitively, mapped to the component that places it there.
    destinations: BTreeMap<String, String>,
}

impl ComponentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates one component declaration and adds it to the graph.
    pub fn register(
        &mut self,
        declaration: &ComponentDecl,
        context: RegisterContext<'_>,
        tree: &DirectoryTree,
    ) -> Result<(), BuildErrors> {
        let mut errors = BuildErrors::new();
        if let Some(node) = lower_component(declaration, context, tree, &mut errors) {
            errors.append(self.insert_node(node, tree));
        }
        errors.into_result(())
    }

    pub fn register_group(
        &mut self,
        declaration: &ComponentGroupDecl,
        tree: &DirectoryTree,
    ) -> Result<(), BuildErrors> {
        let mut errors = BuildErrors::new();
        let location = format!("component_groups['{}']", declaration.id);
        let group_id = declaration.id.trim();

        if group_id.is_empty() {
            errors.push(BuildError::schema(&location, "group id must not be empty"));
        }
        let duplicate = self.group_index.contains_key(group_id);
        if duplicate {
            errors.push(BuildError::duplicate(
                EntityKind::ComponentGroup,
                group_id,
                "package",
            ));
        }
        let directory = match tree.canonical_ref(&declaration.directory) {
            Some(directory) => directory,
            None => {
                errors.push(BuildError::unresolved(
                    format!("component group '{group_id}'"),
                    EntityKind::Directory,
                    declaration.directory.trim(),
                ));
                declaration.directory.trim().to_string()
            }
        };

        let mut members = Vec::new();
        for (index, component) in declaration.components.iter().enumerate() {
            let member_location = format!("{location}.components[{index}]");
            let before = self.components.len();
            if let Err(component_errors) = self.register(
                component,
                RegisterContext {
                    location: &member_location,
                    default_directory: Some(directory.as_str()),
                    group: Some(group_id),
                },
                tree,
            ) {
                errors.append(component_errors);
            }
            if self.components.len() > before {
                members.push(self.components[before].id.clone());
            }
        }

        if !duplicate && !group_id.is_empty() {
            self.group_index
                .insert(group_id.to_string(), self.groups.len());
            self.groups.push(ComponentGroupNode {
                id: group_id.to_string(),
                directory,
                components: members,
            });
        }

        errors.into_result(())
    }

    /// Rebuilds a graph from frozen nodes, revalidating ids, key paths and
    /// references.
    pub fn from_nodes(
        components: Vec<ComponentNode>,
        groups: Vec<ComponentGroupNode>,
        tree: &DirectoryTree,
    ) -> Result<Self, BuildErrors> {
        let mut graph = Self::new();
        let mut errors = BuildErrors::new();

        for node in components {
            if let Some(err) = node.key_path_error() {
                errors.push(err);
            }
            if node.guid.is_empty() {
                errors.push(BuildError::schema(
                    format!("components['{}']", node.id),
                    "frozen component has no guid",
                ));
            }
            errors.append(graph.insert_node(node, tree));
        }

        for group in groups {
            if graph.group_index.contains_key(&group.id) {
                errors.push(BuildError::duplicate(
                    EntityKind::ComponentGroup,
                    &group.id,
                    "package",
                ));
                continue;
            }
            for member in &group.components {
                if !graph.contains(member) {
                    errors.push(BuildError::unresolved(
                        format!("component group '{}'", group.id),
                        EntityKind::Component,
                        member,
                    ));
                }
            }
            graph.group_index.insert(group.id.clone(), graph.groups.len());
            graph.groups.push(group);
        }

        if let Err(edge_errors) = graph.validate_references(tree) {
            errors.append(edge_errors);
        }
        errors.into_result(graph)
    }

    fn insert_node(&mut self, node: ComponentNode, tree: &DirectoryTree) -> BuildErrors {
        let mut errors = BuildErrors::new();

        if self.index.contains_key(&node.id) {
            errors.push(BuildError::duplicate(
                EntityKind::Component,
                &node.id,
                "package",
            ));
            return errors;
        }

        if tree.canonical_ref(&node.directory).is_none() {
            errors.push(BuildError::unresolved(
                format!("component '{}'", node.id),
                EntityKind::Directory,
                &node.directory,
            ));
        }

        if !node.guid.is_empty() {
            if let Some(owner) = self.guids.get(&node.guid) {
                errors.push(BuildError::duplicate(
                    EntityKind::ComponentGuid,
                    &node.guid,
                    format!("components '{owner}' and '{}'", node.id),
                ));
            } else {
                self.guids.insert(node.guid.clone(), node.id.clone());
            }
        }

        for item in node.payload() {
            if self.payload.contains_key(item.id()) {
                errors.push(BuildError::duplicate(item.kind(), item.id(), "package payload"));
                continue;
            }
            self.payload
                .insert(item.id().to_string(), (item.kind(), node.id.clone()));

            let Some((kind, destination)) = install_destination(item, &node.directory, tree) else {
                continue;
            };
            match self.destinations.get(&destination) {
                Some(owner) => {
                    let scope = if *owner == node.id {
                        format!("component '{owner}'")
                    } else {
                        format!("components '{owner}' and '{}'", node.id)
                    };
                    errors.push(BuildError::duplicate(kind, destination, scope));
                }
                None => {
                    self.destinations.insert(destination, node.id.clone());
                }
            }
        }

        debug!(component = %node.id, guid = %node.guid, "registered component");
        self.index.insert(node.id.clone(), self.components.len());
        self.components.push(node);
        errors
    }

    /// Every shortcut edge in the graph.
    pub fn edges(&self) -> Vec<GraphEdge> {
        let mut edges = Vec::new();
        for component in &self.components {
            for shortcut in &component.shortcuts {
                let owner = format!("shortcut '{}'", shortcut.id);
                edges.push(GraphEdge {
                    owner: owner.clone(),
                    kind: EntityKind::Directory,
                    target: shortcut.directory.clone(),
                });
                edges.push(GraphEdge {
                    owner: owner.clone(),
                    kind: EntityKind::Directory,
                    target: shortcut.working_directory.clone(),
                });
                edges.push(GraphEdge {
                    owner,
                    kind: EntityKind::File,
                    target: shortcut.target.clone(),
                });
            }
        }
        edges
    }

    /// Resolves every edge in one pass and reports all dangling ones.
    pub fn validate_references(&self, tree: &DirectoryTree) -> Result<(), BuildErrors> {
        let mut errors = BuildErrors::new();
        for edge in self.edges() {
            let resolved = match edge.kind {
                EntityKind::Directory => tree.canonical_ref(&edge.target).is_some(),
                EntityKind::File => matches!(
                    self.payload.get(edge.target.trim()),
                    Some((EntityKind::File, _))
                ),
                _ => true,
            };
            if !resolved {
                errors.push(BuildError::unresolved(edge.owner, edge.kind, edge.target));
            }
        }
        errors.into_result(())
    }

    pub fn get(&self, id: &str) -> Option<&ComponentNode> {
        self.index.get(id).map(|idx| &self.components[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn group(&self, id: &str) -> Option<&ComponentGroupNode> {
        self.group_index.get(id).map(|idx| &self.groups[*idx])
    }

    pub fn contains_group(&self, id: &str) -> bool {
        self.group_index.contains_key(id)
    }

    pub fn components(&self) -> &[ComponentNode] {
        &self.components
    }

    pub fn groups(&self) -> &[ComponentGroupNode] {
        &self.groups
    }

    /// The file with this id and the component that owns it.
    pub fn file(&self, id: &str) -> Option<(&ComponentNode, &FileEntry)> {
        let (kind, owner) = self.payload.get(id)?;
        if *kind != EntityKind::File {
            return None;
        }
        let component = self.get(owner)?;
        let file = component.files.iter().find(|file| file.id == id)?;
        Some((component, file))
    }

    pub(crate) fn files_mut(&mut self) -> impl Iterator<Item = &mut FileEntry> {
        self.components
            .iter_mut()
            .flat_map(|component| component.files.iter_mut())
    }

    pub(crate) fn into_parts(self) -> (Vec<ComponentNode>, Vec<ComponentGroupNode>) {
        (self.components, self.groups)
    }
}

/// Where a file or shortcut lands on the target system, as
/// `<root id>/<relative path>` in lowercase. `None` for registry values and
/// for items whose directory does not resolve.
fn install_destination(
    item: PayloadRef<'_>,
    component_directory: &str,
    tree: &DirectoryTree,
) -> Option<(EntityKind, String)> {
    let (kind, directory, name) = match item {
        PayloadRef::File(file) => (EntityKind::File, component_directory, file.name.clone()),
        PayloadRef::Shortcut(shortcut) => (
            EntityKind::Shortcut,
            shortcut.directory.as_str(),
            format!("{}.lnk", shortcut.name),
        ),
        PayloadRef::RegistryValue(_) => return None,
    };
    let location = tree.location(directory)?;
    let mut segments = vec![location.root.id().to_string()];
    segments.extend(
        location
            .relative
            .iter()
            .map(|segment| segment.to_string_lossy().into_owned()),
    );
    segments.push(name);
    Some((kind, segments.join("/").to_lowercase()))
}

fn lower_component(
    declaration: &ComponentDecl,
    context: RegisterContext<'_>,
    tree: &DirectoryTree,
    errors: &mut BuildErrors,
) -> Option<ComponentNode> {
    let key_items = declaration
        .files
        .iter()
        .filter(|file| file.key_path)
        .map(|file| file.id.clone())
        .chain(
            declaration
                .registry_values
                .iter()
                .filter(|value| value.key_path)
                .map(|value| value.id.clone()),
        )
        .chain(
            declaration
                .shortcuts
                .iter()
                .filter(|shortcut| shortcut.key_path)
                .map(|shortcut| shortcut.id.clone()),
        )
        .collect::<Vec<_>>();

    let id = match declaration.id.as_deref().map(str::trim) {
        Some("") => {
            errors.push(BuildError::schema(
                context.location,
                "component id must not be empty",
            ));
            None
        }
        Some(id) => Some(id.to_string()),
        None if key_items.len() == 1 => Some(key_items[0].clone()),
        None => {
            errors.push(BuildError::schema(
                context.location,
                "component has no id and no single key path item to take one from",
            ));
            None
        }
    };
    let label = id.clone().unwrap_or_else(|| context.location.to_string());

    if let Some(err) = key_path_error(&label, key_items) {
        errors.push(err);
    }

    let directory = match declaration
        .directory
        .as_deref()
        .or(context.default_directory)
    {
        Some(directory) => tree
            .canonical_ref(directory)
            .unwrap_or_else(|| directory.trim().to_string()),
        None => {
            errors.push(BuildError::schema(
                context.location,
                format!("component '{label}' does not name a directory"),
            ));
            String::new()
        }
    };

    let mut files = Vec::new();
    for file in &declaration.files {
        if file.source.trim().is_empty() {
            errors.push(BuildError::schema(
                format!("files['{}']", file.id),
                "file source must not be empty",
            ));
        }
        let Some(name) = file.resolved_name() else {
            errors.push(BuildError::schema(
                format!("files['{}']", file.id),
                "file has no name and its source has no file name",
            ));
            continue;
        };
        if name.contains(['/', '\\']) || matches!(name, "." | "..") {
            errors.push(BuildError::schema(
                format!("files['{}']", file.id),
                format!("file name must be a single path segment: '{name}'"),
            ));
        }
        files.push(FileEntry {
            id: file.id.trim().to_string(),
            name: name.to_string(),
            source: file.source.trim().to_string(),
            sha256: None,
            size: None,
            key_path: file.key_path,
        });
    }

    let mut registry_values = Vec::new();
    for value in &declaration.registry_values {
        if value.key.trim().is_empty() {
            errors.push(BuildError::schema(
                format!("registry_values['{}']", value.id),
                "registry key must not be empty",
            ));
        }
        registry_values.push(RegistryEntry {
            id: value.id.trim().to_string(),
            root: value.root,
            key: value.key.trim().trim_matches('\\').to_string(),
            name: value.name.clone(),
            value: value.value.clone(),
            key_path: value.key_path,
        });
    }

    let mut shortcuts = Vec::new();
    for shortcut in &declaration.shortcuts {
        if shortcut.name.trim().is_empty() {
            errors.push(BuildError::schema(
                format!("shortcuts['{}']", shortcut.id),
                "shortcut name must not be empty",
            ));
        }
        shortcuts.push(ShortcutEntry {
            id: shortcut.id.trim().to_string(),
            name: shortcut.name.trim().to_string(),
            directory: shortcut.directory.trim().to_string(),
            target: shortcut.target.trim().to_string(),
            working_directory: shortcut.working_directory.trim().to_string(),
            key_path: shortcut.key_path,
        });
    }

    let id = id?;
    let mut node = ComponentNode {
        id,
        guid: String::new(),
        directory,
        vital: declaration.vital,
        group: context.group.map(ToOwned::to_owned),
        files,
        registry_values,
        shortcuts,
    };

    node.guid = match declaration.guid.as_deref().map(str::trim) {
        None | Some(AUTO_GUID) => {
            let key_items = node.payload().filter(PayloadRef::is_key_path).count();
            match node.key_path() {
                Some(key_path) if key_items == 1 && !node.directory.is_empty() => {
                    derive_component_guid(&node.id, &node.directory, &key_path.identity())
                }
                _ => String::new(),
            }
        }
        Some(explicit) => normalize_guid(explicit).unwrap_or_else(|| {
            errors.push(BuildError::schema(
                context.location,
                format!("component '{}' has an invalid guid '{explicit}'", node.id),
            ));
            String::new()
        }),
    };

    Some(node)
}
