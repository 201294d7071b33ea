//! What the build driver hands the engine: directory and archive inputs
//! with their change feed, and where outputs go.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use crate::batch::Status;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: PathBuf,
    #[serde(default)]
    pub status: Status,
}

/// A tree of compiled units (e.g. a module's `classes` directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInput {
    pub name: String,
    pub root: PathBuf,
    /// Only consulted on incremental runs. Paths are relative to `root` or
    /// absolute below it.
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInput {
    pub name: String,
    pub file: PathBuf,
    /// Only consulted on incremental runs.
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformInputs {
    /// Whether the driver offers a change feed for this run.
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub directories: Vec<DirectoryInput>,
    #[serde(default)]
    pub archives: Vec<ArchiveInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Directory,
    Archive,
}

/// Resolves where each input's output lives.
pub trait OutputProvider: Send + Sync {
    fn content_location(&self, name: &str, format: ContentFormat) -> PathBuf;

    /// Removes every prior output. Called before a full run.
    fn delete_all(&self) -> Result<(), EngineError>;
}

/// Puts every output under one root directory, named after its input.
#[derive(Debug, Clone)]
pub struct FolderOutputProvider {
    root: PathBuf,
}

impl FolderOutputProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl OutputProvider for FolderOutputProvider {
    fn content_location(&self, name: &str, format: ContentFormat) -> PathBuf {
        let mut safe: String = name
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                c => c,
            })
            .collect();
        // "", "." and ".." would name the root or its parent
        if safe.chars().all(|c| c == '.') {
            safe = format!("_{safe}");
        }
        match format {
            ContentFormat::Directory => self.root.join(safe),
            ContentFormat::Archive if safe.ends_with(".jar") => self.root.join(safe),
            ContentFormat::Archive => self.root.join(format!("{safe}.jar")),
        }
    }

    fn delete_all(&self) -> Result<(), EngineError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| EngineError::io(&self.root, e))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| EngineError::io(&self.root, e))
    }
}

/// JSON description of one transform run, as written by a driver script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub output_dir: PathBuf,
    #[serde(flatten)]
    pub inputs: TransformInputs,
}

impl Manifest {
    /// Reads a manifest; relative paths in it are taken relative to the
    /// manifest's own directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        let base = path.parent().unwrap_or(Path::new(""));
        manifest.output_dir = base.join(&manifest.output_dir);
        for dir in &mut manifest.inputs.directories {
            dir.root = base.join(&dir.root);
        }
        for archive in &mut manifest.inputs.archives {
            archive.file = base.join(&archive.file);
        }
        Ok(manifest)
    }

    pub fn output_provider(&self) -> FolderOutputProvider {
        FolderOutputProvider::new(&self.output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn folder_provider_names_outputs_after_inputs() {
        let p = FolderOutputProvider::new("/out");
        assert_eq!(
            p.content_location("app/classes", ContentFormat::Directory),
            PathBuf::from("/out/app_classes")
        );
        assert_eq!(
            p.content_location("okio-3.0", ContentFormat::Archive),
            PathBuf::from("/out/okio-3.0.jar")
        );
        assert_eq!(
            p.content_location("lib.jar", ContentFormat::Archive),
            PathBuf::from("/out/lib.jar")
        );
    }

    #[test]
    fn dot_names_stay_inside_the_root() {
        let p = FolderOutputProvider::new("/out");
        assert_eq!(
            p.content_location("..", ContentFormat::Directory),
            PathBuf::from("/out/_..")
        );
        assert_eq!(
            p.content_location("", ContentFormat::Directory),
            PathBuf::from("/out/_")
        );
        assert_eq!(
            p.content_location(".", ContentFormat::Archive),
            PathBuf::from("/out/_..jar")
        );
    }

    #[test]
    fn delete_all_leaves_an_empty_root() {
        let root = temp_dir("perspective-eye-out");
        fs::create_dir_all(root.join("old/nested")).unwrap();
        fs::write(root.join("old/nested/A.class"), b"a").unwrap();

        let p = FolderOutputProvider::new(&root);
        p.delete_all().unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn manifest_resolves_relative_paths() {
        let dir = temp_dir("perspective-eye-manifest");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");
        fs::write(
            &path,
            r#"{
                "incremental": true,
                "output_dir": "out",
                "directories": [
                    {"name": "classes", "root": "build/classes",
                     "changed_files": [{"path": "a/B.class", "status": "changed"}]}
                ],
                "archives": [{"name": "lib", "file": "/abs/lib.jar", "status": "removed"}]
            }"#,
        )
        .unwrap();

        let m = Manifest::load(&path).unwrap();
        assert!(m.inputs.incremental);
        assert_eq!(m.output_dir, dir.join("out"));
        assert_eq!(m.inputs.directories[0].root, dir.join("build/classes"));
        assert_eq!(m.inputs.directories[0].changed_files[0].status, Status::Changed);
        assert_eq!(m.inputs.archives[0].file, PathBuf::from("/abs/lib.jar"));
        assert_eq!(m.inputs.archives[0].status, Status::Removed);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn manifest_defaults_to_a_full_run() {
        let m: Manifest = serde_json::from_str(r#"{"output_dir": "/out"}"#).unwrap();
        assert!(!m.inputs.incremental);
        assert!(m.inputs.directories.is_empty());
        assert!(m.inputs.archives.is_empty());
    }
}
