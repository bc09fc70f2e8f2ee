use anyhow::{anyhow, Context, Result};
use instill_core::{
    compile, BuildError, BuildErrors, Descriptor, EntityKind, FileEntry, InstallGraph,
    PayloadDigest, ARTIFACT_MANIFEST_FILE, ARTIFACT_PAYLOAD_DIR,
};
use instill_security::{sha256_reader_hex, verify_sha256_file};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PackageBuildError {
    #[error(transparent)]
    Invalid(#[from] BuildErrors),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct BuiltPackage {
    pub manifest_path: PathBuf,
    pub graph: InstallGraph,
    pub blobs_written: usize,
}

/// Hashes every file source of `graph` under `source_root`.
pub fn collect_payload_digests(
    graph: &InstallGraph,
    source_root: &Path,
) -> Result<BTreeMap<String, PayloadDigest>, BuildErrors> {
    let mut errors = BuildErrors::new();
    let mut digests = BTreeMap::new();

    for component in graph.components().components() {
        for file in &component.files {
            let owner = format!("file '{}'", file.id);
            let Some(path) = source_path(source_root, &file.source) else {
                errors.push(BuildError::schema(
                    format!("files['{}'].source", file.id),
                    format!("source must be a relative path inside the source tree: '{}'", file.source),
                ));
                continue;
            };

            let opened = fs::File::open(&path).and_then(|handle| {
                let size = handle.metadata()?.len();
                Ok((handle, size))
            });
            let (handle, size) = match opened {
                Ok(opened) => opened,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    errors.push(BuildError::unresolved(
                        owner,
                        EntityKind::SourceFile,
                        &file.source,
                    ));
                    continue;
                }
                Err(err) => {
                    errors.push(BuildError::schema(
                        format!("files['{}'].source", file.id),
                        format!("cannot read {}: {err}", path.display()),
                    ));
                    continue;
                }
            };

            match sha256_reader_hex(handle) {
                Ok(sha256) => {
                    debug!(file = %file.id, %sha256, size, "hashed payload source");
                    digests.insert(file.id.clone(), PayloadDigest { sha256, size });
                }
                Err(err) => errors.push(BuildError::schema(
                    format!("files['{}'].source", file.id),
                    format!("cannot hash {}: {err:#}", path.display()),
                )),
            }
        }
    }

    errors.into_result(digests)
}

fn source_path(source_root: &Path, source: &str) -> Option<PathBuf> {
    let relative = Path::new(source);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(source_root.join(relative))
}

/// Runs every build-time check. With a source tree, payload sources are also
/// resolved and the returned graph is sealed with their digests.
pub fn validate_package(
    descriptor: &Descriptor,
    source_root: Option<&Path>,
) -> Result<InstallGraph, BuildErrors> {
    let graph = compile(descriptor)?;
    match source_root {
        Some(root) => {
            let digests = collect_payload_digests(&graph, root)?;
            graph.seal_payload(&digests)
        }
        None => Ok(graph),
    }
}

/// Validates, then writes `package.json` and content-addressed payload blobs
/// into `output_dir`. Nothing is written when validation fails.
pub fn build_package(
    descriptor: &Descriptor,
    source_root: &Path,
    output_dir: &Path,
) -> Result<BuiltPackage, PackageBuildError> {
    let graph = validate_package(descriptor, Some(source_root))?;

    let payload_dir = output_dir.join(ARTIFACT_PAYLOAD_DIR);
    fs::create_dir_all(&payload_dir)
        .with_context(|| format!("failed to create {}", payload_dir.display()))?;

    let mut blobs_written = 0;
    let mut seen = BTreeSet::new();
    for component in graph.components().components() {
        for file in &component.files {
            let sha256 = sealed_digest(file)?;
            if !seen.insert(sha256.to_string()) {
                continue;
            }
            let blob = payload_dir.join(sha256);
            if blob.exists() {
                continue;
            }
            let source = source_root.join(&file.source);
            let staged = payload_dir.join(format!("{sha256}.tmp"));
            fs::copy(&source, &staged).with_context(|| {
                format!(
                    "failed to copy payload {} to {}",
                    source.display(),
                    staged.display()
                )
            })?;
            fs::rename(&staged, &blob)
                .with_context(|| format!("failed to store payload blob {}", blob.display()))?;
            blobs_written += 1;
        }
    }

    let manifest_path = output_dir.join(ARTIFACT_MANIFEST_FILE);
    let staged_manifest = output_dir.join(format!("{ARTIFACT_MANIFEST_FILE}.tmp"));
    let mut manifest = graph
        .to_json_pretty()
        .context("failed to serialize package manifest")?;
    manifest.push('\n');
    fs::write(&staged_manifest, manifest)
        .with_context(|| format!("failed to write {}", staged_manifest.display()))?;
    fs::rename(&staged_manifest, &manifest_path)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    info!(
        package = %graph.package().name,
        version = %graph.package().version,
        blobs_written,
        "built package"
    );
    Ok(BuiltPackage {
        manifest_path,
        graph,
        blobs_written,
    })
}

fn sealed_digest(file: &FileEntry) -> Result<&str> {
    file.sha256
        .as_deref()
        .ok_or_else(|| anyhow!("file '{}' has no payload digest", file.id))
}

/// A built package opened for planning or installation. Payload blobs are
/// verified against their recorded digests when the package is opened.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    root: PathBuf,
    graph: InstallGraph,
}

impl LoadedPackage {
    /// Accepts the package directory or its `package.json`.
    pub fn open(path: &Path) -> Result<Self> {
        let (root, manifest_path) = if path.is_dir() {
            (path.to_path_buf(), path.join(ARTIFACT_MANIFEST_FILE))
        } else {
            let root = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (root, path.to_path_buf())
        };

        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read package manifest: {}", manifest_path.display()))?;
        let graph = InstallGraph::from_json_str(&raw).with_context(|| {
            format!("failed to parse package manifest: {}", manifest_path.display())
        })?;
        if !graph.is_sealed() {
            return Err(anyhow!(
                "package manifest {} has files without payload digests",
                manifest_path.display()
            ));
        }

        let package = Self { root, graph };
        let mut verified = BTreeSet::new();
        for component in package.graph.components().components() {
            for file in &component.files {
                let sha256 = sealed_digest(file)?;
                if verified.insert(sha256.to_string()) {
                    let blob = package.payload_path(file)?;
                    verify_sha256_file(&blob, sha256).with_context(|| {
                        format!("payload for file '{}' failed verification", file.id)
                    })?;
                }
            }
        }
        Ok(package)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph(&self) -> &InstallGraph {
        &self.graph
    }

    pub fn payload_path(&self, file: &FileEntry) -> Result<PathBuf> {
        Ok(self
            .root
            .join(ARTIFACT_PAYLOAD_DIR)
            .join(sealed_digest(file)?))
    }
}
