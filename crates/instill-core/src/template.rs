//! Placeholder substitution.
//!
//! Runs before any structural validation and turns a descriptor with
//! `${...}` bindings into a fully literal one. The pass is pure: it only reads
//! the descriptor it is given and returns a new one.
//!
//! Supported placeholders:
//!
//! - `${package.name}`, `${package.manufacturer}`, `${package.version}`,
//!   `${package.upgrade_code}`
//! - `${directory:ID}`: the substituted name of a declared directory
//! - `${file:ID}`: the installed name of a declared file
//!
//! Directory and file names may only use package placeholders, which keeps
//! the pass total: every binding is literal before anything refers to it.

use std::collections::BTreeMap;

use crate::descriptor::{Descriptor, DEFAULT_DOWNGRADE_MESSAGE};
use crate::error::{BuildError, BuildErrors, EntityKind};

const OPEN: &str = "${";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allowed {
    PackageOnly,
    Any,
}

#[derive(Debug, Default)]
struct Bindings {
    package: BTreeMap<&'static str, String>,
    directories: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
}

pub fn substitute(descriptor: &Descriptor) -> Result<Descriptor, BuildErrors> {
    let mut errors = BuildErrors::new();
    let out = substitute_collecting(descriptor, &mut errors);
    errors.into_result(out)
}

/// Substitutes every placeholder it can, recording the rest in `errors`. A
/// field that fails keeps its placeholder text, so the result can still be
/// validated structurally.
pub fn substitute_collecting(descriptor: &Descriptor, errors: &mut BuildErrors) -> Descriptor {
    let mut out = descriptor.clone();

    let package = &descriptor.package;
    for (field, value) in [
        ("name", &package.name),
        ("manufacturer", &package.manufacturer),
        ("upgrade_code", &package.upgrade_code),
        ("version", &package.version),
    ] {
        require_literal(value, &format!("package.{field}"), errors);
    }

    let mut bindings = Bindings::default();
    bindings.package.insert("name", package.name.clone());
    bindings
        .package
        .insert("manufacturer", package.manufacturer.clone());
    bindings.package.insert("version", package.version.clone());
    bindings
        .package
        .insert("upgrade_code", package.upgrade_code.clone());

    for directory in &mut out.directories {
        let location = format!("directories['{}']", directory.id);
        require_literal(&directory.id, &format!("{location}.id"), errors);
        require_literal(&directory.parent, &format!("{location}.parent"), errors);
        directory.name = expand(
            &directory.name,
            &bindings,
            Allowed::PackageOnly,
            &format!("{location}.name"),
            errors,
        );
        bindings
            .directories
            .entry(directory.id.clone())
            .or_insert_with(|| directory.name.clone());
    }

    for component in out.all_components_mut() {
        for file in &mut component.files {
            let location = format!("files['{}']", file.id);
            require_literal(&file.id, &format!("{location}.id"), errors);
            require_literal(&file.source, &format!("{location}.source"), errors);
            if let Some(name) = &file.name {
                file.name = Some(expand(
                    name,
                    &bindings,
                    Allowed::PackageOnly,
                    &format!("{location}.name"),
                    errors,
                ));
            }
            if let Some(resolved) = file.resolved_name() {
                bindings
                    .files
                    .entry(file.id.clone())
                    .or_insert_with(|| resolved.to_string());
            }
        }
    }

    for component in out.all_components_mut() {
        let label = component.id.clone().unwrap_or_else(|| "<unnamed>".to_string());
        let location = format!("components['{label}']");
        require_literal_opt(&component.id, &format!("{location}.id"), errors);
        require_literal_opt(&component.guid, &format!("{location}.guid"), errors);
        require_literal_opt(
            &component.directory,
            &format!("{location}.directory"),
            errors,
        );

        for value in &mut component.registry_values {
            let location = format!("registry_values['{}']", value.id);
            require_literal(&value.id, &format!("{location}.id"), errors);
            value.key = expand(
                &value.key,
                &bindings,
                Allowed::Any,
                &format!("{location}.key"),
                errors,
            );
            if let Some(name) = &value.name {
                value.name = Some(expand(
                    name,
                    &bindings,
                    Allowed::Any,
                    &format!("{location}.name"),
                    errors,
                ));
            }
            value.value = expand(
                &value.value,
                &bindings,
                Allowed::Any,
                &format!("{location}.value"),
                errors,
            );
        }

        for shortcut in &mut component.shortcuts {
            let location = format!("shortcuts['{}']", shortcut.id);
            require_literal(&shortcut.id, &format!("{location}.id"), errors);
            require_literal(
                &shortcut.directory,
                &format!("{location}.directory"),
                errors,
            );
            require_literal(&shortcut.target, &format!("{location}.target"), errors);
            require_literal(
                &shortcut.working_directory,
                &format!("{location}.working_directory"),
                errors,
            );
            shortcut.name = expand(
                &shortcut.name,
                &bindings,
                Allowed::Any,
                &format!("{location}.name"),
                errors,
            );
        }
    }

    for group in &out.component_groups {
        let location = format!("component_groups['{}']", group.id);
        require_literal(&group.id, &format!("{location}.id"), errors);
        require_literal(&group.directory, &format!("{location}.directory"), errors);
    }

    for feature in &mut out.features {
        let location = format!("features['{}']", feature.id);
        require_literal(&feature.id, &format!("{location}.id"), errors);
        for reference in feature.components.iter().chain(&feature.component_groups) {
            require_literal(reference, &format!("{location} reference"), errors);
        }
        if let Some(title) = &feature.title {
            feature.title = Some(expand(
                title,
                &bindings,
                Allowed::Any,
                &format!("{location}.title"),
                errors,
            ));
        }
    }

    let message = descriptor
        .package
        .downgrade_message
        .as_deref()
        .unwrap_or(DEFAULT_DOWNGRADE_MESSAGE);
    out.package.downgrade_message = Some(expand(
        message,
        &bindings,
        Allowed::Any,
        "package.downgrade_message",
        errors,
    ));

    out
}

/// True when `text` still carries an unexpanded placeholder.
pub fn has_placeholder(text: &str) -> bool {
    text.contains(OPEN)
}

fn require_literal(text: &str, location: &str, errors: &mut BuildErrors) {
    if has_placeholder(text) {
        errors.push(BuildError::schema(
            location,
            format!("placeholders are not allowed here: '{text}'"),
        ));
    }
}

fn require_literal_opt(text: &Option<String>, location: &str, errors: &mut BuildErrors) {
    if let Some(text) = text {
        require_literal(text, location, errors);
    }
}

fn expand(
    text: &str,
    bindings: &Bindings,
    allowed: Allowed,
    location: &str,
    errors: &mut BuildErrors,
) -> String {
    if !has_placeholder(text) {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            errors.push(BuildError::schema(
                location,
                format!("unterminated placeholder in '{text}'"),
            ));
            out.push_str(&rest[start..]);
            return out;
        };

        let token = after[..end].trim();
        match resolve_token(token, bindings, allowed, location) {
            Ok(value) => out.push_str(&value),
            Err(err) => {
                errors.push(err);
                out.push_str(&rest[start..start + OPEN.len() + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_token(
    token: &str,
    bindings: &Bindings,
    allowed: Allowed,
    location: &str,
) -> Result<String, BuildError> {
    if let Some(field) = token.strip_prefix("package.") {
        return bindings.package.get(field).cloned().ok_or_else(|| {
            BuildError::schema(location, format!("unknown package placeholder '${{{token}}}'"))
        });
    }

    let (kind, id) = match token.split_once(':') {
        Some(("directory", id)) => (EntityKind::Directory, id.trim()),
        Some(("file", id)) => (EntityKind::File, id.trim()),
        _ => {
            return Err(BuildError::schema(
                location,
                format!("unknown placeholder '${{{token}}}'"),
            ));
        }
    };

    if allowed == Allowed::PackageOnly {
        return Err(BuildError::schema(
            location,
            format!("placeholder '${{{token}}}' is not allowed in entity names; use package placeholders only"),
        ));
    }

    let table = match kind {
        EntityKind::Directory => &bindings.directories,
        _ => &bindings.files,
    };
    table
        .get(id)
        .cloned()
        .ok_or_else(|| BuildError::unresolved(format!("placeholder in {location}"), kind, id))
}
