//! In-memory configuration snapshots and their tar.gz packaging.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directories never uploaded with a configuration
const SKIPPED_DIRS: &[&str] = &[".git", ".terraform"];

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("could not read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
    #[error("could not build configuration archive: {0}")]
    Archive(String),
    #[error("configuration directory {} contains no files", .0.display())]
    Empty(PathBuf),
}

/// Configuration files keyed by their slash-separated path relative to the root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    files: BTreeMap<String, Vec<u8>>,
    required_providers: BTreeSet<String>,
}

impl ConfigurationSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every file under `root`, skipping tool state directories
    pub fn from_dir(root: &Path) -> Result<Self, PackageError> {
        let mut snapshot = Self::new();
        snapshot.collect(root, "")?;
        if snapshot.files.is_empty() {
            return Err(PackageError::Empty(root.to_path_buf()));
        }
        Ok(snapshot)
    }

    fn collect(&mut self, dir: &Path, prefix: &str) -> Result<(), PackageError> {
        let io_err = |path: &Path, e: std::io::Error| PackageError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| io_err(dir, e))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            if path.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    self.collect(&path, &relative)?;
                }
            } else if path.is_file() {
                let contents = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
                self.insert(relative, contents);
            }
        }
        Ok(())
    }

    fn insert(&mut self, path: String, contents: Vec<u8>) {
        if path.ends_with(".tf") {
            self.required_providers
                .extend(declared_providers(&String::from_utf8_lossy(&contents)));
        }
        self.files.insert(path, contents);
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path.trim_start_matches('/').to_string(), contents.into());
        self
    }

    pub fn with_provider(mut self, name: &str) -> Self {
        self.required_providers.insert(name.to_string());
        self
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn required_providers(&self) -> &BTreeSet<String> {
        &self.required_providers
    }

    /// Pack the snapshot as a gzip-compressed tarball
    pub fn package(&self) -> Result<Vec<u8>, PackageError> {
        let archive_err = |e: std::io::Error| PackageError::Archive(e.to_string());

        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(gz);

        for (path, contents) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, path, contents.as_slice())
                .map_err(archive_err)?;
        }

        tar.into_inner()
            .map_err(archive_err)?
            .finish()
            .map_err(archive_err)
    }
}

/// Provider names declared with `provider "<name>"` blocks
fn declared_providers(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("provider"))
        .filter_map(|rest| {
            let rest = rest.trim_start().strip_prefix('"')?;
            let end = rest.find('"')?;
            Some(rest[..end].to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}
