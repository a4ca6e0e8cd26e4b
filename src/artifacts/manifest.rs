//! Required-file manifests and signed download manifests
//!
//! Two different "manifests" meet here:
//! - the *required file list* a model family needs on disk before loading,
//!   mixing exact filenames and filename patterns
//! - the *signed manifest* returned by the API, mapping filenames to
//!   time-limited download URLs, nested at a different key per endpoint

use crate::error::{LmmError, LmmResult};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// One entry of a family's required file list
#[derive(Debug, Clone)]
pub enum RequiredFile {
    Exact(String),
    /// Anchored pattern; satisfied when any file in the directory matches
    Pattern(Regex),
}

impl RequiredFile {
    pub fn exact(name: &str) -> Self {
        Self::Exact(name.to_string())
    }

    /// Build an anchored pattern entry. Patterns are compile-time constants
    /// in the family table, so an invalid one is a programming error caught
    /// by the family tests.
    pub fn pattern(pattern: &str) -> LmmResult<Self> {
        Regex::new(&format!("^(?:{})$", pattern))
            .map(Self::Pattern)
            .map_err(|e| LmmError::configuration(format!("Invalid file pattern {pattern}: {e}")))
    }

    pub fn matches(&self, filename: &str) -> bool {
        match self {
            Self::Exact(name) => name == filename,
            Self::Pattern(re) => re.is_match(filename),
        }
    }

    /// Check the entry against a directory listing
    pub fn is_satisfied_by(&self, present: &[String]) -> bool {
        present.iter().any(|name| self.matches(name))
    }
}

impl fmt::Display for RequiredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Files a family needs, split into required and optional companions
#[derive(Debug, Clone, Default)]
pub struct FileManifest {
    pub required: Vec<RequiredFile>,
    /// Downloaded when offered, never required
    pub optional: Vec<String>,
}

impl FileManifest {
    /// Required entries not satisfied by the files currently in `dir`
    pub fn missing_in(&self, dir: &Path) -> Vec<RequiredFile> {
        let present = list_files(dir);
        self.required
            .iter()
            .filter(|entry| !entry.is_satisfied_by(&present))
            .cloned()
            .collect()
    }

    pub fn is_complete_in(&self, dir: &Path) -> bool {
        self.missing_in(dir).is_empty()
    }
}

/// Plain filenames directly under `dir`; empty when it does not exist
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
    }
    names.sort();
    names
}

/// Which API endpoint serves a model's signed manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// `{"weights": {...}}`
    CoreModel,
    /// `{"ort": {"weights": {...}}}`
    Versioned,
    /// `{"modelFiles": {"transformers": {...}}}`
    Instant,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoreModel => "core_model",
            Self::Versioned => "ort",
            Self::Instant => "instant",
        }
    }

    /// Path of keys leading to the filename → URL mapping
    fn weights_path(&self) -> &'static [&'static str] {
        match self {
            Self::CoreModel => &["weights"],
            Self::Versioned => &["ort", "weights"],
            Self::Instant => &["modelFiles", "transformers"],
        }
    }

    /// Extract the signed manifest from an API response
    pub fn extract_manifest(&self, response: &Value) -> LmmResult<SignedManifest> {
        let mut node = response;
        for key in self.weights_path() {
            node = node.get(key).ok_or_else(|| {
                LmmError::artifact(format!(
                    "`{}` key not available in API response while downloading model weights",
                    key
                ))
            })?;
        }

        let map = node.as_object().ok_or_else(|| {
            LmmError::artifact(format!(
                "`{}` in API response is not a filename mapping",
                self.weights_path().join(".")
            ))
        })?;

        let mut entries = Vec::with_capacity(map.len());
        for (name, url) in map {
            let url = url.as_str().ok_or_else(|| {
                LmmError::artifact(format!("Download URL for `{}` is not a string", name))
            })?;
            entries.push((name.clone(), url.to_string()));
        }

        Ok(SignedManifest { entries })
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manifest key → signed URL, in API order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedManifest {
    entries: Vec<(String, String)>,
}

impl SignedManifest {
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn url_for(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, url)| url.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Filename a signed URL persists under: last path segment, query stripped
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}
