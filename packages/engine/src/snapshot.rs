//! Document packages: saving and loading engine configurations.
//!
//! A package is a directory:
//!
//! ```text
//! <package>/
//!   manifest.json          { "repoId": …, "nodeIndex": [ … ] }
//!   nodes/<uuid>.json      one encoded node per indexed id
//! ```
//!
//! Saving stages a complete package next to the target and swaps it in.
//! Node files that are at least as new as the content being saved are
//! carried over by hard link, so an unchanged node keeps its file and its
//! modification time.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ingress_dynamo::{Identifier, IngressError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::EngineConfig;

/// Name of the manifest file at the root of a package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding the node files.
pub const NODE_DIR: &str = "nodes";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "repoId")]
    repo_id: Identifier,
    #[serde(rename = "nodeIndex")]
    node_index: Vec<Identifier>,
}

#[derive(Debug, Clone)]
struct EncodedNode {
    bytes: Vec<u8>,
    modified: SystemTime,
}

/// A fully encoded, immutable copy of an engine configuration.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    repository_id: Identifier,
    nodes: BTreeMap<Identifier, EncodedNode>,
}

impl EngineSnapshot {
    /// Encode every node of `config`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for (id, snapshot) in config.node_snapshots() {
            let node = EncodedNode {
                bytes: snapshot.encode()?,
                modified: snapshot.modified(),
            };
            nodes.insert(id, node);
        }
        Ok(Self {
            repository_id: config.repository_id(),
            nodes,
        })
    }

    pub fn repository_id(&self) -> Identifier {
        self.repository_id
    }

    pub fn node_ids(&self) -> impl Iterator<Item = Identifier> + '_ {
        self.nodes.keys().copied()
    }

    /// Encoded file of one node.
    pub fn node_bytes(&self, id: Identifier) -> Option<&[u8]> {
        self.nodes.get(&id).map(|node| node.bytes.as_slice())
    }

    /// Write the package to `path`, replacing whatever package is there.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let existing = path.is_dir();
        info!(
            "Saving engine snapshot for repository {} to {} package at {}",
            self.repository_id,
            if existing { "existing" } else { "new" },
            path.display()
        );
        self.write_package(path).inspect_err(|err| {
            error!(
                repository = %self.repository_id,
                target = %path.display(),
                error = %err,
                "Failed to save snapshot data"
            )
        })
    }

    fn write_package(&self, target: &Path) -> Result<()> {
        if target.exists() && !target.is_dir() {
            return Err(IngressError::BadArguments(format!(
                "'{}' is not a package directory",
                target.display()
            )));
        }

        let staging = sibling(target, "staging")?;
        let staged = self.stage(target, &staging);
        if let Err(err) = staged.and_then(|()| swap_into_place(&staging, target)) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        Ok(())
    }

    /// Build the complete package in `staging`.
    fn stage(&self, target: &Path, staging: &Path) -> Result<()> {
        let node_dir = staging.join(NODE_DIR);
        fs::create_dir_all(&node_dir)?;

        let manifest = Manifest {
            repo_id: self.repository_id,
            node_index: self.nodes.keys().copied().collect(),
        };
        fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;

        let (mut kept, mut written) = (0, 0);
        for (id, node) in &self.nodes {
            let name = node_file_name(*id);
            let current = target.join(NODE_DIR).join(&name);
            let staged = node_dir.join(&name);

            if is_at_least(&current, node.modified) {
                carry_over(&current, &staged)?;
                kept += 1;
            } else {
                write_node(&staged, &node.bytes, node.modified)?;
                written += 1;
            }
        }
        debug!(
            repository = %self.repository_id.brief_id(),
            "Staged package with {kept} unchanged and {written} rewritten nodes"
        );
        Ok(())
    }
}

/// Read the configuration stored in the package at `path`.
///
/// Node files are kept as raw bytes; decoding happens once an environment
/// exists to decode them into.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    let load_id = Identifier::new();
    debug!(load = %load_id.brief_id(), "Loading repository package from {}", path.display());
    read_config(path).inspect_err(|err| {
        error!(
            load = %load_id.brief_id(),
            error = %err,
            "Failed to load an engine repository from {}",
            path.display()
        )
    })
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let (manifest_bytes, _) = read_resource(path, MANIFEST_FILE)?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|err| IngressError::invalid_resource(MANIFEST_FILE, err))?;

    let mut config = EngineConfig::new(manifest.repo_id);
    for id in manifest.node_index {
        let name = format!("{NODE_DIR}/{}", node_file_name(id));
        let (bytes, modified) = read_resource(path, &name)?;
        config.save_cached_node(id, bytes, modified);
    }
    Ok(config)
}

/// Read a regular file of the package and its modification time.
fn read_resource(package: &Path, name: &str) -> Result<(Vec<u8>, Option<SystemTime>)> {
    let path = package.join(name);
    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(IngressError::RepoResourceNotFound(name.to_string()))
        }
        Err(err) => return Err(err.into()),
    };
    if !metadata.is_file() {
        return Err(IngressError::invalid_resource(
            name,
            "The resource is not a valid, regular file.",
        ));
    }
    let bytes = fs::read(&path)?;
    Ok((bytes, metadata.modified().ok()))
}

fn node_file_name(id: Identifier) -> String {
    format!("{id}.json")
}

/// A hidden, unique path next to `target`.
fn sibling(target: &Path, purpose: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| IngressError::BadArguments(format!("'{}' has no file name", target.display())))?;
    let name = format!(".{}.{}.{purpose}", name.to_string_lossy(), Identifier::new().brief_id());
    Ok(target.with_file_name(name))
}

fn is_at_least(path: &Path, modified: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .is_ok_and(|current| current >= modified)
}

/// Reuse an existing node file, preserving its modification time.
fn carry_over(current: &Path, staged: &Path) -> Result<()> {
    if fs::hard_link(current, staged).is_ok() {
        return Ok(());
    }
    let modified = fs::metadata(current)?.modified()?;
    fs::copy(current, staged)?;
    File::options().write(true).open(staged)?.set_modified(modified)?;
    Ok(())
}

/// Write a node file stamped with the time its content changed.
fn write_node(path: &Path, bytes: &[u8], modified: SystemTime) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    file.set_modified(modified)?;
    Ok(())
}

/// Replace `target` with `staging`, restoring the old package on failure.
fn swap_into_place(staging: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        fs::rename(staging, target)?;
        return Ok(());
    }

    let backup = sibling(target, "backup")?;
    fs::rename(target, &backup)?;
    if let Err(err) = fs::rename(staging, target) {
        let _ = fs::rename(&backup, target);
        return Err(err.into());
    }
    if let Err(err) = fs::remove_dir_all(&backup) {
        debug!(error = %err, "Failed to remove previous package at {}", backup.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_dynamo::DynamoSnapshot;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_with(names: &[&str]) -> EngineConfig {
        let mut config = EngineConfig::new(Identifier::new());
        for name in names {
            config.save_node_snapshot(DynamoSnapshot::new(
                Identifier::new(),
                "test.named",
                json!({ "name": name }),
            ));
        }
        config
    }

    #[test]
    fn save_writes_manifest_and_nodes() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("repo.ingress");
        let config = config_with(&["a", "b"]);

        EngineSnapshot::new(&config).unwrap().save_to(&package).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(package.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["repoId"], config.repository_id().to_string());
        assert_eq!(manifest["nodeIndex"].as_array().unwrap().len(), 2);
        for id in config.node_ids() {
            let node: serde_json::Value = serde_json::from_slice(
                &fs::read(package.join(NODE_DIR).join(format!("{id}.json"))).unwrap(),
            )
            .unwrap();
            assert_eq!(node["dynamoId"], id.to_string());
            assert_eq!(node["typeId"], "test.named");
        }
    }

    #[test]
    fn load_reads_cached_nodes() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("repo.ingress");
        let config = config_with(&["a"]);
        let snapshot = EngineSnapshot::new(&config).unwrap();
        snapshot.save_to(&package).unwrap();

        let loaded = load_config(&package).unwrap();
        assert_eq!(loaded.repository_id(), config.repository_id());
        let id = config.node_ids().next().unwrap();
        let node = loaded.node_snapshot(id).unwrap();
        assert!(node.is_cached());
        assert_eq!(node.encode().unwrap(), snapshot.node_bytes(id).unwrap());
    }

    #[test]
    fn load_reports_missing_resources() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            load_config(dir.path()).unwrap_err(),
            IngressError::RepoResourceNotFound(MANIFEST_FILE.into())
        );

        let id = Identifier::new();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            json!({ "repoId": Identifier::new(), "nodeIndex": [id] }).to_string(),
        )
        .unwrap();
        assert_eq!(
            load_config(dir.path()).unwrap_err(),
            IngressError::RepoResourceNotFound(format!("nodes/{id}.json"))
        );
    }

    #[test]
    fn load_rejects_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{ not json").unwrap();
        assert!(matches!(
            load_config(dir.path()),
            Err(IngressError::RepoResourceInvalid { name, .. }) if name == MANIFEST_FILE
        ));

        fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();
        fs::create_dir(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(matches!(
            load_config(dir.path()),
            Err(IngressError::RepoResourceInvalid { .. })
        ));
    }

    #[test]
    fn save_replaces_package_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("repo.ingress");
        let snapshot = EngineSnapshot::new(&config_with(&["a"])).unwrap();
        snapshot.save_to(&package).unwrap();
        snapshot.save_to(&package).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("repo.ingress")]);
    }

    #[test]
    fn save_refuses_plain_file_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("repo.ingress");
        fs::write(&target, b"not a package").unwrap();

        let snapshot = EngineSnapshot::new(&config_with(&[])).unwrap();
        assert!(matches!(
            snapshot.save_to(&target),
            Err(IngressError::BadArguments(_))
        ));
    }
}
