//! Filesystem scanner producing a [`DigestStore`] from real file content

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::digest::DigestStore;
use crate::error::{DigestError, Result};
use crate::hash::ContentHash;

/// Directory names that are never descended into
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
];

/// File suffixes that are never hashed
pub const DEFAULT_EXCLUDED_EXTENSIONS: &[&str] = &[".pyc", ".pyo", ".so", ".dylib", ".dll"];

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory names to skip, matched against the final component
    pub excluded_dirs: Vec<String>,
    /// File name suffixes to skip
    pub excluded_extensions: Vec<String>,
    /// Whether to follow symbolic links (default: false)
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
            excluded_extensions: DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            follow_symlinks: false,
        }
    }
}

impl ScanConfig {
    /// Add directory names on top of the current exclusions
    pub fn exclude_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dir in dirs {
            let dir = dir.into();
            if !self.excluded_dirs.contains(&dir) {
                self.excluded_dirs.push(dir);
            }
        }
        self
    }

    fn is_excluded_dir(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|d| d == name)
    }

    fn is_excluded_file(&self, name: &str) -> bool {
        self.excluded_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

/// Walks a directory tree and hashes every regular file
pub struct Scanner {
    root: PathBuf,
    config: ScanConfig,
}

impl Scanner {
    /// Create a scanner for the given root with default exclusions
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: ScanConfig::default(),
        }
    }

    /// Create a scanner with custom configuration
    pub fn with_config(root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the tree into a digest keyed by root-relative, `/`-separated
    /// paths.
    ///
    /// Any unreadable directory or file fails the whole scan; no partial
    /// digest is returned.
    pub fn scan(&self) -> Result<DigestStore> {
        let started = Instant::now();

        let meta = std::fs::metadata(&self.root).map_err(|e| DigestError::io(&self.root, e))?;
        if !meta.is_dir() {
            return Err(DigestError::io(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "scan root is not a directory"),
            ));
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(self.config.follow_symlinks)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let keep = !self.config.is_excluded_dir(&e.file_name().to_string_lossy());
                if !keep {
                    debug!("Skipping excluded directory {:?}", e.path());
                }
                keep
            });

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
                DigestError::io(path, source)
            })?;

            if !entry.file_type().is_file() {
                continue;
            }
            if self.config.is_excluded_file(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let rel = relative_path(&self.root, entry.path())?;
            let hash = hash_file(entry.path())?;
            entries.push((rel, hash));
        }

        let store = DigestStore::from_hashes(entries)?;
        info!(
            root = %self.root.display(),
            files = store.len(),
            aggregate = %store.aggregate_hash().short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(store)
    }
}

/// SHA-256 of a file's content
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let file = File::open(path).map_err(|e| DigestError::io(path, e))?;
    ContentHash::from_reader(BufReader::new(file)).map_err(|e| DigestError::io(path, e))
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| DigestError::InvalidPath {
        path: path.display().to_string(),
        reason: "path escapes the scan root".to_string(),
    })?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => {
                    return Err(DigestError::InvalidPath {
                        path: rel.display().to_string(),
                        reason: "path is not valid UTF-8".to_string(),
                    });
                }
            },
            _ => {
                return Err(DigestError::InvalidPath {
                    path: rel.display().to_string(),
                    reason: "unexpected path component".to_string(),
                });
            }
        }
    }
    Ok(parts.join("/"))
}
