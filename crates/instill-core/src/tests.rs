use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::*;

const EDITOR: &str = r#"
[package]
name = "Acme Editor"
manufacturer = "Acme"
upgrade_code = "{8f3c1a52-6b0e-4d7a-9c21-5e4b3a2f1d00}"
version = "1.2.0"

[[directories]]
id = "INSTALLFOLDER"
name = "${package.name}"
parent = "ProgramFiles64Folder"

[[directories]]
id = "MENUFOLDER"
name = "${package.manufacturer}"
parent = "start menu"

[[components]]
directory = "INSTALLFOLDER"

[[components.files]]
id = "editor_exe"
source = "bin/editor.exe"
key_path = true

[[components]]
id = "docs"
directory = "INSTALLFOLDER"
vital = false

[[components.files]]
id = "readme"
source = "docs/README.txt"
key_path = true

[[component_groups]]
id = "menu"
directory = "MENUFOLDER"

[[component_groups.components]]
id = "menu_shortcut"

[[component_groups.components.shortcuts]]
id = "editor_lnk"
name = "${package.name} ${package.version}"
directory = "MENUFOLDER"
target = "editor_exe"
working_directory = "INSTALLFOLDER"

[[component_groups.components.registry_values]]
id = "menu_marker"
root = "HKCU"
key = "Software\\${package.manufacturer}\\${package.name}"
name = "StartMenu"
value = "${directory:MENUFOLDER}/${file:editor_exe}"
key_path = true

[[features]]
id = "main"
title = "${package.name}"
components = ["editor_exe"]
component_groups = ["menu"]
required = true

[[features]]
id = "docs"
components = ["docs"]
default_selected = false
"#;

fn editor_descriptor() -> Descriptor {
    Descriptor::from_toml_str(EDITOR).expect("descriptor should parse")
}

fn editor_graph() -> InstallGraph {
    compile(&editor_descriptor()).expect("descriptor should compile")
}

fn directory(id: &str, name: &str, parent: &str) -> DirectoryDecl {
    DirectoryDecl {
        id: id.to_string(),
        name: name.to_string(),
        parent: parent.to_string(),
    }
}

fn codes(errors: &BuildErrors) -> Vec<&'static str> {
    errors.iter().map(BuildError::code).collect()
}

#[test]
fn compile_editor_descriptor() {
    let graph = editor_graph();

    let package = graph.package();
    assert_eq!(package.name, "Acme Editor");
    assert_eq!(package.upgrade_code, "8F3C1A52-6B0E-4D7A-9C21-5E4B3A2F1D00");
    assert_eq!(package.version.to_string(), "1.2.0");
    assert_eq!(package.scope, InstallScope::Either);
    assert_eq!(package.same_version, SameVersionPolicy::Decline);
    assert_eq!(
        package.downgrade_message,
        "A newer version of Acme Editor is already installed."
    );

    let ids = graph
        .components()
        .components()
        .iter()
        .map(|component| component.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["editor_exe", "docs", "menu_shortcut"]);

    let menu = graph
        .components()
        .get("menu_shortcut")
        .expect("menu component should exist");
    assert_eq!(menu.directory, "MENUFOLDER");
    assert_eq!(menu.group.as_deref(), Some("menu"));
    assert_eq!(menu.shortcuts[0].name, "Acme Editor 1.2.0");
    assert_eq!(menu.registry_values[0].key, "Software\\Acme\\Acme Editor");
    assert_eq!(menu.registry_values[0].value, "Acme/editor.exe");
    assert_eq!(
        menu.key_path().map(|item| item.id().to_string()),
        Some("menu_marker".to_string())
    );

    let main = graph.features().get("main").expect("main feature");
    assert_eq!(main.title, "Acme Editor");
    assert_eq!(graph.features().get("docs").map(|f| f.title.as_str()), Some("docs"));

    for component in graph.components().components() {
        assert!(is_valid_guid(&component.guid), "{}", component.guid);
    }
}

#[test]
fn directory_locations_follow_declared_names() {
    let graph = editor_graph();
    assert_eq!(
        graph.location("INSTALLFOLDER"),
        Some(DirectoryLocation {
            root: KnownFolder::ProgramFiles64,
            relative: PathBuf::from("Acme Editor"),
        })
    );
    assert_eq!(
        graph.location("MENUFOLDER").map(|location| location.root),
        Some(KnownFolder::ProgramMenu)
    );
    assert_eq!(
        graph.location("DesktopFolder"),
        Some(DirectoryLocation {
            root: KnownFolder::Desktop,
            relative: PathBuf::new(),
        })
    );
    assert_eq!(graph.location("NOPE"), None);
}

#[test]
fn product_versions_compare_numerically_with_padding() {
    let parse = |value: &str| ProductVersion::parse(value).expect("valid version");

    assert_eq!(parse("1.2"), parse("1.2.0"));
    assert_eq!(parse("1.2").cmp(&parse("1.2.0.0")), Ordering::Equal);
    assert!(parse("0.2.0") > parse("0.1.0"));
    assert!(parse("1.10") > parse("1.9"));
    assert!(parse("2") > parse("1.99.99"));
    assert_eq!(compare_versions("3.0.1", "3.0.0"), Ok(Ordering::Greater));
    assert_eq!(parse("1.2.0").to_string(), "1.2.0");
}

#[test]
fn product_version_rejects_malformed_input() {
    for input in ["", "1..2", "1.a", ".1", "1.2.", "-1"] {
        assert!(
            ProductVersion::parse(input).is_err(),
            "'{input}' should be rejected"
        );
    }
}

#[test]
fn unparseable_package_version_is_reported() {
    let descriptor = editor_descriptor();
    let mut broken = descriptor.clone();
    broken.package.version = "1.x".to_string();

    let errors = compile(&broken).expect_err("bad version must fail");
    assert_eq!(codes(&errors), vec!["VersionParseError"]);
}

#[test]
fn substitution_rejects_placeholders_in_ids_and_unknown_references() {
    let mut descriptor = editor_descriptor();
    descriptor.directories[0].id = "${package.name}".to_string();
    descriptor.component_groups[0].components[0].registry_values[0].value =
        "${file:missing}".to_string();
    descriptor.directories[1].name = "${directory:INSTALLFOLDER}".to_string();

    let errors = substitute(&descriptor).expect_err("substitution must fail");
    let codes = codes(&errors);
    assert_eq!(codes.len(), 3, "{errors}");
    assert!(codes.contains(&"UnresolvedReferenceError"));
    assert_eq!(
        codes.iter().filter(|code| **code == "SchemaError").count(),
        2
    );
}

#[test]
fn compile_reports_placeholder_and_structural_errors_together() {
    let mut descriptor = editor_descriptor();
    descriptor.features[0].title = Some("${package.edition}".to_string());
    descriptor.components[1].files[0].key_path = false;

    let errors = compile(&descriptor).expect_err("both problems must be reported");
    let codes = codes(&errors);
    assert_eq!(codes.len(), 2, "{errors}");
    assert!(codes.contains(&"SchemaError"), "{errors}");
    assert!(codes.contains(&"MissingKeyPathError"), "{errors}");
}

#[test]
fn substitution_reports_unterminated_placeholder() {
    let mut descriptor = editor_descriptor();
    descriptor.features[0].title = Some("${package.name".to_string());

    let errors = substitute(&descriptor).expect_err("substitution must fail");
    assert_eq!(codes(&errors), vec!["SchemaError"]);
    assert!(!has_placeholder("plain text"));
}

#[test]
fn directory_tree_rejects_duplicate_ids() {
    let errors = DirectoryTree::build(&[
        directory("APP", "App", "ProgramFilesFolder"),
        directory("APP", "Other", "ProgramFilesFolder"),
    ])
    .expect_err("duplicate must fail");

    assert_eq!(
        errors.into_vec(),
        vec![BuildError::DuplicateId {
            kind: EntityKind::Directory,
            id: "APP".to_string(),
            scope: "parent 'ProgramFilesFolder'".to_string(),
        }]
    );
}

#[test]
fn directory_tree_rejects_unknown_parent() {
    let errors = DirectoryTree::build(&[directory("APP", "App", "NotAFolder")])
        .expect_err("unknown parent must fail");
    assert_eq!(
        errors.into_vec(),
        vec![BuildError::UnresolvedParent {
            directory: "APP".to_string(),
            parent: "NotAFolder".to_string(),
        }]
    );
}

#[test]
fn directory_tree_rejects_cycles() {
    let errors = DirectoryTree::build(&[
        directory("A", "a", "B"),
        directory("B", "b", "A"),
        directory("SELF", "self", "SELF"),
    ])
    .expect_err("cycles must fail");

    assert_eq!(
        codes(&errors),
        vec![
            "DirectoryCycleError",
            "DirectoryCycleError",
            "DirectoryCycleError"
        ]
    );
}

#[test]
fn directory_tree_rejects_parent_declared_after_child() {
    let mut errors = BuildErrors::new();
    let tree = DirectoryTree::build_collecting(
        &[
            directory("BIN", "bin", "APP"),
            directory("APP", "App", "local app data"),
        ],
        &mut errors,
    );

    assert_eq!(
        errors.into_vec(),
        vec![BuildError::UnresolvedParent {
            directory: "BIN".to_string(),
            parent: "APP".to_string(),
        }]
    );
    assert!(!tree.contains("BIN"));
    assert_eq!(
        tree.location("APP"),
        Some(DirectoryLocation {
            root: KnownFolder::LocalAppData,
            relative: PathBuf::from("App"),
        })
    );
}

#[test]
fn directory_tree_places_children_under_earlier_parents() {
    let tree = DirectoryTree::build(&[
        directory("APP", "App", "local app data"),
        directory("BIN", "bin", "APP"),
    ])
    .expect("parents come first");

    assert_eq!(
        tree.location("BIN"),
        Some(DirectoryLocation {
            root: KnownFolder::LocalAppData,
            relative: PathBuf::from("App").join("bin"),
        })
    );
    assert_eq!(
        tree.chain("BIN")
            .iter()
            .map(|node| node.id.as_str())
            .collect::<Vec<_>>(),
        vec!["APP", "BIN"]
    );
}

#[test]
fn known_folders_parse_by_id_or_friendly_name() {
    assert_eq!(
        KnownFolder::parse("programfiles64folder"),
        Some(KnownFolder::ProgramFiles64)
    );
    assert_eq!(KnownFolder::parse("Start Menu"), Some(KnownFolder::ProgramMenu));
    assert_eq!(KnownFolder::parse("Documents"), None);
}

#[test]
fn component_without_key_path_is_rejected() {
    let mut descriptor = editor_descriptor();
    descriptor.components[1].files[0].key_path = false;

    let errors = compile(&descriptor).expect_err("missing key path must fail");
    assert_eq!(
        errors.into_vec(),
        vec![BuildError::MissingKeyPath {
            component: "docs".to_string(),
        }]
    );
}

#[test]
fn component_with_two_key_paths_is_rejected() {
    let mut descriptor = editor_descriptor();
    let menu = &mut descriptor.component_groups[0].components[0];
    menu.shortcuts[0].key_path = true;

    let errors = compile(&descriptor).expect_err("two key paths must fail");
    assert_eq!(
        errors.into_vec(),
        vec![BuildError::MultipleKeyPath {
            component: "menu_shortcut".to_string(),
            items: vec!["menu_marker".to_string(), "editor_lnk".to_string()],
        }]
    );
}

#[test]
fn compile_reports_every_problem_at_once() {
    let mut descriptor = editor_descriptor();
    descriptor.components[0].directory = Some("MISSING".to_string());
    descriptor.components[1].files[0].key_path = false;
    descriptor.features[0].components.push("ghost".to_string());
    descriptor
        .directories
        .push(directory("LOOP", "loop", "LOOP"));

    let errors = compile(&descriptor).expect_err("descriptor is broken");
    let codes = codes(&errors);
    assert!(codes.contains(&"UnresolvedReferenceError"), "{errors}");
    assert!(codes.contains(&"MissingKeyPathError"), "{errors}");
    assert!(codes.contains(&"DirectoryCycleError"), "{errors}");
    assert!(
        errors
            .iter()
            .any(|err| matches!(err, BuildError::UnresolvedReference { id, .. } if id == "ghost")),
        "{errors}"
    );
    assert!(errors.len() >= 4);
    assert!(errors.to_string().starts_with(&format!("{} build error", errors.len())));
}

#[test]
fn duplicate_payload_and_component_ids_are_rejected() {
    let mut descriptor = editor_descriptor();
    let mut copy = descriptor.components[1].clone();
    copy.files[0].source = "docs/OTHER.txt".to_string();
    descriptor.components.push(copy);

    let errors = compile(&descriptor).expect_err("duplicates must fail");
    let codes = codes(&errors);
    assert!(codes.iter().all(|code| *code == "DuplicateIdError"), "{errors}");
    assert!(errors.iter().any(|err| matches!(
        err,
        BuildError::DuplicateId {
            kind: EntityKind::Component,
            ..
        }
    )));
}

#[test]
fn two_components_installing_the_same_file_are_rejected() {
    let mut descriptor = editor_descriptor();
    let mut notes = descriptor.components[1].clone();
    notes.id = Some("notes".to_string());
    notes.files[0].id = "notes_readme".to_string();
    notes.files[0].source = "notes/readme.txt".to_string();
    descriptor.components.push(notes);
    descriptor.features[1].components.push("notes".to_string());

    let errors = compile(&descriptor).expect_err("colliding destinations must fail");
    assert_eq!(
        errors.into_vec(),
        vec![BuildError::DuplicateId {
            kind: EntityKind::File,
            id: "programfiles64folder/acme editor/readme.txt".to_string(),
            scope: "components 'docs' and 'notes'".to_string(),
        }]
    );
}

#[test]
fn same_file_name_in_different_directories_is_allowed() {
    let mut descriptor = editor_descriptor();
    let mut notes = descriptor.components[1].clone();
    notes.id = Some("notes".to_string());
    notes.directory = Some("MENUFOLDER".to_string());
    notes.files[0].id = "notes_readme".to_string();
    descriptor.components.push(notes);
    descriptor.features[1].components.push("notes".to_string());

    let graph = compile(&descriptor).expect("distinct destinations compile");
    assert!(graph.components().get("notes").is_some());
}

#[test]
fn shortcut_target_must_be_a_declared_file() {
    let mut descriptor = editor_descriptor();
    descriptor.component_groups[0].components[0].shortcuts[0].target = "nothing".to_string();

    let errors = compile(&descriptor).expect_err("dangling target must fail");
    assert_eq!(
        errors.into_vec(),
        vec![BuildError::unresolved(
            "shortcut 'editor_lnk'",
            EntityKind::File,
            "nothing"
        )]
    );
}

#[test]
fn component_not_reached_by_any_feature_is_rejected() {
    let mut descriptor = editor_descriptor();
    descriptor.features.retain(|feature| feature.id != "docs");

    let errors = compile(&descriptor).expect_err("orphan must fail");
    assert_eq!(codes(&errors), vec!["SchemaError"]);
    assert!(errors.to_string().contains("components['docs']"));
}

#[test]
fn component_guids_are_stable_across_builds() {
    let first = editor_graph();
    let second = editor_graph();
    let guids = |graph: &InstallGraph| {
        graph
            .components()
            .components()
            .iter()
            .map(|component| component.guid.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(guids(&first), guids(&second));

    let mut renamed = editor_descriptor();
    renamed.components[0].files[0].name = Some("editor2.exe".to_string());
    let renamed = compile(&renamed).expect("still valid");
    assert_ne!(guids(&first)[0], guids(&renamed)[0]);
    assert_eq!(guids(&first)[1], guids(&renamed)[1]);
}

#[test]
fn explicit_guid_is_normalized_and_must_be_unique() {
    let mut descriptor = editor_descriptor();
    descriptor.components[0].guid = Some("{0a1b2c3d-0000-4000-8000-00000000abcd}".to_string());
    let graph = compile(&descriptor).expect("explicit guid is valid");
    assert_eq!(
        graph.components().get("editor_exe").map(|c| c.guid.as_str()),
        Some("0A1B2C3D-0000-4000-8000-00000000ABCD")
    );

    descriptor.components[1].guid = Some("0A1B2C3D-0000-4000-8000-00000000ABCD".to_string());
    let errors = compile(&descriptor).expect_err("shared guid must fail");
    assert!(errors.iter().any(|err| matches!(
        err,
        BuildError::DuplicateId {
            kind: EntityKind::ComponentGuid,
            ..
        }
    )));
}

#[test]
fn derived_guid_has_guid_shape() {
    let guid = derive_component_guid("app", "INSTALLFOLDER", "file:app_exe:app.exe");
    assert_eq!(
        guid,
        derive_component_guid("app", "INSTALLFOLDER", "file:app_exe:app.exe")
    );
    assert!(is_valid_guid(&guid));
    assert_eq!(&guid[14..15], "5");
    assert_ne!(guid, derive_component_guid("app", "OTHER", "file:app_exe:app.exe"));
}

#[test]
fn feature_selection_honors_defaults_and_required() {
    let graph = editor_graph();
    let features = graph.features();

    let defaults = features
        .select(&[], &[], graph.components())
        .expect("default selection");
    assert_eq!(defaults.features().to_vec(), vec!["main".to_string()]);
    let components = features
        .components_for(&defaults, graph.components())
        .iter()
        .map(|component| component.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(components, vec!["editor_exe", "menu_shortcut"]);

    let everything = features
        .select(&["docs".to_string()], &[], graph.components())
        .expect("include docs");
    assert_eq!(
        features.components_for(&everything, graph.components()).len(),
        3
    );

    assert_eq!(
        features.select(&[], &["main".to_string()], graph.components()),
        Err(FeatureSelectionError::RequiredFeature("main".to_string()))
    );
    assert_eq!(
        features.select(&["extras".to_string()], &[], graph.components()),
        Err(FeatureSelectionError::UnknownFeature("extras".to_string()))
    );
}

#[test]
fn feature_selection_rejects_shortcut_without_its_target() {
    let descriptor = Descriptor::from_toml_str(
        &EDITOR.replace("target = \"editor_exe\"", "target = \"readme\""),
    )
    .expect("descriptor should parse");
    let graph = compile(&descriptor).expect("descriptor should compile");
    let features = graph.features();

    let err = features
        .select(&[], &[], graph.components())
        .expect_err("shortcut target is not selected");
    assert_eq!(
        err,
        FeatureSelectionError::UntargetedShortcut {
            shortcut: "editor_lnk".to_string(),
            target: "readme".to_string(),
            component: "docs".to_string(),
        }
    );
    assert!(err.to_string().contains("editor_lnk"));

    let with_docs = features
        .select(&["docs".to_string()], &[], graph.components())
        .expect("target component is selected");
    assert!(with_docs.contains("docs"));
}

#[test]
fn scope_resolution_depends_on_elevation() {
    assert_eq!(InstallScope::Either.resolve(false), Ok(ResolvedScope::PerUser));
    assert_eq!(InstallScope::Either.resolve(true), Ok(ResolvedScope::PerMachine));
    assert_eq!(InstallScope::PerUser.resolve(true), Ok(ResolvedScope::PerUser));
    assert_eq!(
        InstallScope::PerMachine.resolve(false),
        Err(ScopeError::ElevationRequired)
    );
    assert_eq!(
        RegistryRoot::Hkmu.for_scope(ResolvedScope::PerUser),
        RegistryRoot::Hkcu
    );
}

#[test]
fn sealed_graph_survives_artifact_json() {
    let graph = editor_graph();
    let digests = BTreeMap::from([
        (
            "editor_exe".to_string(),
            PayloadDigest {
                sha256: "a".repeat(64),
                size: 42,
            },
        ),
        (
            "readme".to_string(),
            PayloadDigest {
                sha256: "b".repeat(64),
                size: 7,
            },
        ),
    ]);
    let sealed = graph.seal_payload(&digests).expect("all files have digests");
    assert!(sealed.is_sealed());

    let json = sealed.to_json_pretty().expect("serialize");
    assert!(json.contains("\"format_version\": 1"));
    let restored = InstallGraph::from_json_str(&json).expect("deserialize");
    assert_eq!(restored, sealed);
}

#[test]
fn sealing_without_a_digest_reports_the_source() {
    let graph = editor_graph();
    let errors = graph
        .seal_payload(&BTreeMap::new())
        .expect_err("missing digests must fail");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|err| matches!(
        err,
        BuildError::UnresolvedReference {
            kind: EntityKind::SourceFile,
            ..
        }
    )));
}

#[test]
fn artifact_with_unknown_format_version_is_rejected() {
    let mut artifact = PackageArtifact::from(editor_graph());
    artifact.format_version = 99;
    let errors = InstallGraph::try_from(artifact).expect_err("version must match");
    assert_eq!(codes(&errors), vec!["SchemaError"]);
}
