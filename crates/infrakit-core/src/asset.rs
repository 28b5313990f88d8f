//! File assets and bundling options.
//!
//! An asset is a local directory (or file) that is staged into the cloud
//! assembly under `asset.<hash>` and uploaded before the stacks that use it
//! are deployed. When bundling options are present the directory is first
//! transformed by running a command in a container image, with the source
//! mounted at [`ASSET_INPUT_DIR`] and the output collected from
//! [`ASSET_OUTPUT_DIR`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::{Error, Result};

/// Where the asset source is mounted inside the bundling container.
pub const ASSET_INPUT_DIR: &str = "/asset-input";
/// Where the bundling container must write its output.
pub const ASSET_OUTPUT_DIR: &str = "/asset-output";

/// Options for bundling an asset inside a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlingOptions {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// A local asset referenced from a resource property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Source path, relative to the app definition's directory.
    pub path: String,
    pub bundling: Option<BundlingOptions>,
    /// Caller-provided fingerprint; replaces hashing the source contents.
    pub source_hash: Option<String>,
}

impl Asset {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bundling: None,
            source_hash: None,
        }
    }

    /// Absolute (or base-relative) location of the asset source.
    pub fn source_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.path)
    }

    /// Compute the asset hash used for staging and manifest keys.
    ///
    /// A custom source hash is itself hashed, so the result always has the
    /// same shape. Otherwise the source tree (sorted relative paths and file
    /// contents) is hashed together with the bundling options.
    pub fn fingerprint(&self, base_dir: &Path) -> Result<String> {
        let mut hasher = Sha256::new();

        if let Some(custom) = &self.source_hash {
            hasher.update(custom.as_bytes());
            return Ok(hex::encode(hasher.finalize()));
        }

        let source = self.source_path(base_dir);
        if !source.exists() {
            return Err(Error::NotFound(format!(
                "asset source '{}'",
                source.display()
            )));
        }

        for file in list_files(&source)? {
            let relative = file
                .strip_prefix(&source)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(&file)?);
            hasher.update([0u8]);
        }

        if let Some(bundling) = &self.bundling {
            hasher.update(serde_json::to_vec(bundling)?);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// All regular files below `root`, in file-name order. A file root yields
/// itself. Symbolic links are not followed.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    walk_files(root, false)
}

/// Like [`list_files`], skipping entries whose name starts with `.` (and
/// everything below a hidden directory).
pub fn list_visible_files(root: &Path) -> Result<Vec<PathBuf>> {
    walk_files(root, true)
}

fn walk_files(root: &Path, skip_hidden: bool) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(skip_hidden && entry.depth() > 0 && is_hidden(entry)));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Copy `files` (all below `src`) to the same relative locations in `dst`.
pub fn copy_files(src: &Path, dst: &Path, files: &[PathBuf]) -> Result<u64> {
    std::fs::create_dir_all(dst)?;
    for file in files {
        let relative = file.strip_prefix(src).map_err(|_| {
            Error::InvalidInput(format!(
                "'{}' is not below '{}'",
                file.display(),
                src.display()
            ))
        })?;
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(file, &target)?;
    }
    Ok(files.len() as u64)
}

/// Recursively copy `src` (file or directory) into `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    if src.is_file() {
        std::fs::create_dir_all(dst)?;
        let name = src
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("bad path '{}'", src.display())))?;
        std::fs::copy(src, dst.join(name))?;
        return Ok(1);
    }
    copy_files(src, dst, &list_files(src)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(input: &[u8]) -> String {
        hex::encode(Sha256::digest(input))
    }

    #[test]
    fn test_custom_hash_is_rehashed() {
        let mut asset = Asset::new("code");
        asset.source_hash = Some(sha256_hex(b"hello"));

        let hash = asset.fingerprint(Path::new("/nonexistent")).unwrap();
        assert_eq!(hash, sha256_hex(sha256_hex(b"hello").as_bytes()));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_directory_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("code/pkg")).unwrap();
        std::fs::write(dir.path().join("code/hello.py"), "def world(): pass").unwrap();
        std::fs::write(dir.path().join("code/pkg/util.py"), "X = 1").unwrap();

        let asset = Asset::new("code");
        let first = asset.fingerprint(dir.path()).unwrap();
        assert_eq!(first, asset.fingerprint(dir.path()).unwrap());

        std::fs::write(dir.path().join("code/pkg/util.py"), "X = 2").unwrap();
        let second = asset.fingerprint(dir.path()).unwrap();
        assert_ne!(first, second);

        let mut bundled = asset.clone();
        bundled.bundling = Some(BundlingOptions {
            image: "python:3.8".to_string(),
            command: vec!["bash".into(), "-c".into(), "cp -r /asset-input/* /asset-output/".into()],
            environment: BTreeMap::new(),
        });
        assert_ne!(second, bundled.fingerprint(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = Asset::new("missing").fingerprint(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("top.txt"), "1").unwrap();
        std::fs::write(src.join("a/b/deep.txt"), "2").unwrap();

        let dst = dir.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(dst.join("a/b/deep.txt")).unwrap(), "2");
    }

    #[test]
    fn test_visible_files_skip_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(dir.path().join("code")).unwrap();
        std::fs::write(dir.path().join(".git/objects/ab"), "x").unwrap();
        std::fs::write(dir.path().join(".env"), "x").unwrap();
        std::fs::write(dir.path().join("code/b.py"), "x").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let names = |files: Vec<PathBuf>| -> Vec<String> {
            files
                .iter()
                .map(|f| f.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
                .collect()
        };
        assert_eq!(
            names(list_visible_files(dir.path()).unwrap()),
            vec!["a.txt", "code/b.py"]
        );
        assert_eq!(list_files(dir.path()).unwrap().len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("code");
        std::fs::create_dir_all(&code).unwrap();
        std::fs::write(code.join("index.py"), "pass").unwrap();
        std::os::unix::fs::symlink(&code, code.join("loop")).unwrap();

        assert_eq!(list_files(&code).unwrap(), vec![code.join("index.py")]);
        assert!(Asset::new("code").fingerprint(dir.path()).is_ok());
    }
}
