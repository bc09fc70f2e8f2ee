use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::{ComponentGraph, ComponentNode};
use crate::descriptor::FeatureDecl;
use crate::error::{BuildError, BuildErrors, EntityKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub component_groups: Vec<String>,
    pub default_selected: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureSelectionError {
    #[error("unknown feature '{0}'")]
    UnknownFeature(String),
    #[error("feature '{0}' is required and cannot be deselected")]
    RequiredFeature(String),
    #[error(
        "shortcut '{shortcut}' targets file '{target}' of component '{component}', which is not selected"
    )]
    UntargetedShortcut {
        shortcut: String,
        target: String,
        component: String,
    },
}

/// Feature ids chosen for one install, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSelection {
    features: Vec<String>,
}

impl FeatureSelection {
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn contains(&self, id: &str) -> bool {
        self.features.iter().any(|feature| feature == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTree {
    features: Vec<FeatureNode>,
    index: BTreeMap<String, usize>,
}

impl FeatureTree {
    pub fn build(declarations: &[FeatureDecl], graph: &ComponentGraph) -> Result<Self, BuildErrors> {
        let nodes = declarations
            .iter()
            .map(|declaration| FeatureNode {
                id: declaration.id.trim().to_string(),
                title: declaration
                    .title
                    .clone()
                    .unwrap_or_else(|| declaration.id.trim().to_string()),
                components: declaration
                    .components
                    .iter()
                    .map(|id| id.trim().to_string())
                    .collect(),
                component_groups: declaration
                    .component_groups
                    .iter()
                    .map(|id| id.trim().to_string())
                    .collect(),
                default_selected: declaration.default_selected,
                required: declaration.required,
            })
            .collect();
        Self::from_nodes(nodes, graph)
    }

    pub fn from_nodes(nodes: Vec<FeatureNode>, graph: &ComponentGraph) -> Result<Self, BuildErrors> {
        let mut tree = Self::default();
        let mut errors = BuildErrors::new();

        for node in nodes {
            if node.id.is_empty() {
                errors.push(BuildError::schema("features", "feature id must not be empty"));
                continue;
            }
            if tree.index.contains_key(&node.id) {
                errors.push(BuildError::duplicate(EntityKind::Feature, &node.id, "package"));
                continue;
            }

            let owner = format!("feature '{}'", node.id);
            for component in &node.components {
                if !graph.contains(component) {
                    errors.push(BuildError::unresolved(
                        &owner,
                        EntityKind::Component,
                        component,
                    ));
                }
            }
            for group in &node.component_groups {
                if !graph.contains_group(group) {
                    errors.push(BuildError::unresolved(
                        &owner,
                        EntityKind::ComponentGroup,
                        group,
                    ));
                }
            }

            tree.index.insert(node.id.clone(), tree.features.len());
            tree.features.push(node);
        }

        errors.into_result(tree)
    }

    pub fn get(&self, id: &str) -> Option<&FeatureNode> {
        self.index.get(id).map(|idx| &self.features[*idx])
    }

    pub fn features(&self) -> &[FeatureNode] {
        &self.features
    }

    /// Default selection adjusted by explicit includes and excludes. Required
    /// features are always selected. A selection that installs a shortcut
    /// without the component owning its target file is rejected.
    pub fn select(
        &self,
        include: &[String],
        exclude: &[String],
        graph: &ComponentGraph,
    ) -> Result<FeatureSelection, FeatureSelectionError> {
        for id in include.iter().chain(exclude) {
            if !self.index.contains_key(id.as_str()) {
                return Err(FeatureSelectionError::UnknownFeature(id.clone()));
            }
        }
        for id in exclude {
            if self.get(id).is_some_and(|feature| feature.required) {
                return Err(FeatureSelectionError::RequiredFeature(id.clone()));
            }
        }

        let features = self
            .features
            .iter()
            .filter(|feature| {
                feature.required
                    || ((feature.default_selected || include.contains(&feature.id))
                        && !exclude.contains(&feature.id))
            })
            .map(|feature| feature.id.clone())
            .collect();
        let selection = FeatureSelection { features };
        self.check_shortcut_targets(&selection, graph)?;
        Ok(selection)
    }

    fn check_shortcut_targets(
        &self,
        selection: &FeatureSelection,
        graph: &ComponentGraph,
    ) -> Result<(), FeatureSelectionError> {
        let selected = self.components_for(selection, graph);
        for component in &selected {
            for shortcut in &component.shortcuts {
                let Some((owner, _)) = graph.file(&shortcut.target) else {
                    continue;
                };
                if !selected.iter().any(|chosen| chosen.id == owner.id) {
                    return Err(FeatureSelectionError::UntargetedShortcut {
                        shortcut: shortcut.id.clone(),
                        target: shortcut.target.clone(),
                        component: owner.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Component ids reached from the given features, directly or through
    /// groups.
    fn reached_ids<'a>(
        &self,
        features: impl Iterator<Item = &'a FeatureNode>,
        graph: &ComponentGraph,
    ) -> BTreeSet<String> {
        let mut reached = BTreeSet::new();
        for feature in features {
            reached.extend(feature.components.iter().cloned());
            for group in &feature.component_groups {
                if let Some(group) = graph.group(group) {
                    reached.extend(group.components.iter().cloned());
                }
            }
        }
        reached
    }

    /// Components to install for `selection`, each once, in graph order.
    pub fn components_for<'g>(
        &self,
        selection: &FeatureSelection,
        graph: &'g ComponentGraph,
    ) -> Vec<&'g ComponentNode> {
        let reached = self.reached_ids(
            self.features
                .iter()
                .filter(|feature| selection.contains(&feature.id)),
            graph,
        );
        graph
            .components()
            .iter()
            .filter(|component| reached.contains(&component.id))
            .collect()
    }

    /// Every component that at least one feature reaches.
    pub fn referenced_components(&self, graph: &ComponentGraph) -> BTreeSet<String> {
        self.reached_ids(self.features.iter(), graph)
    }

    pub(crate) fn into_nodes(self) -> Vec<FeatureNode> {
        self.features
    }
}
