//! File-backed registry store. Each value is one file under
//! `registry/<HIVE>/<key segments>/<name>.value`; the unnamed default value
//! is stored as `@default.value`.

use anyhow::{Context, Result};
use instill_core::{RegistryEntry, RegistryRoot, ResolvedScope};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::fs_utils::sanitize_segment;
use crate::SystemLayout;

const DEFAULT_VALUE_NAME: &str = "@default";

pub fn registry_value_path(
    layout: &SystemLayout,
    root: RegistryRoot,
    key: &str,
    name: Option<&str>,
) -> PathBuf {
    let mut path = layout.registry_hive_dir(root);
    for segment in key.split(['\\', '/']).filter(|segment| !segment.trim().is_empty()) {
        path.push(sanitize_segment(segment));
    }
    let file_name = match name.map(str::trim) {
        None | Some("") => DEFAULT_VALUE_NAME.to_string(),
        Some(name) => sanitize_segment(name),
    };
    path.push(format!("{file_name}.value"));
    path
}

/// Where a declared registry value lands for the resolved scope.
pub fn entry_path(layout: &SystemLayout, entry: &RegistryEntry, scope: ResolvedScope) -> PathBuf {
    registry_value_path(
        layout,
        entry.root.for_scope(scope),
        &entry.key,
        entry.name.as_deref(),
    )
}

pub fn read_registry_value(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err)
            .with_context(|| format!("failed to read registry value: {}", path.display())),
    }
}
