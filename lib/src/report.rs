//! The authoritative in-memory record of what ended up in the target tree:
//! one [`ReportEntry`] per target path, naming every slice that caused its
//! existence, with a single-definition invariant enforced on insert.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    model::SliceKey,
};

/// A single target path's on-disk shape, as recorded the first time any
/// slice causes it to exist.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    /// Path relative to the target root, e.g. `/usr/bin/hello`.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Symlink target or hard link source, if this entry is a link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Size in bytes; `0` for directories and symlinks.
    pub size: u64,
    /// SHA-256 of the content as first written, hex-encoded. `None` for
    /// directories and symlinks.
    #[serde(serialize_with = "serialize_hash", skip_serializing_if = "Option::is_none")]
    pub sha256: Option<[u8; 32]>,
    /// SHA-256 after mutation, if a script changed this file's content.
    #[serde(serialize_with = "serialize_hash", skip_serializing_if = "Option::is_none")]
    pub final_sha256: Option<[u8; 32]>,
    /// Every slice that declared (and so owns) this path.
    pub slices: BTreeSet<SliceKey>,
}

fn serialize_hash<S: serde::Serializer>(hash: &Option<[u8; 32]>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match hash {
        Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
        None => serializer.serialize_none(),
    }
}

impl ReportEntry {
    fn matches(&self, other: &NewEntry<'_>) -> Option<(&'static str, String, String)> {
        if self.mode != other.mode {
            return Some(("mode", format!("{:04o}", self.mode), format!("{:04o}", other.mode)));
        }
        if self.link.as_deref() != other.link {
            return Some(("link", format!("{:?}", self.link), format!("{:?}", other.link)));
        }
        if self.size != other.size {
            return Some(("size", self.size.to_string(), other.size.to_string()));
        }
        if self.sha256 != other.sha256 {
            return Some((
                "sha256",
                self.sha256.map(hex::encode).unwrap_or_default(),
                other.sha256.map(hex::encode).unwrap_or_default(),
            ));
        }
        None
    }
}

/// The fields of a freshly-created disk entry, as reported by the filesystem
/// primitive, prior to being recorded against a slice.
#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    /// Permission bits.
    pub mode: u32,
    /// Symlink target or hard link source, if any.
    pub link: Option<&'a str>,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the content, for regular files.
    pub sha256: Option<[u8; 32]>,
}

/// The report: every target path the pipeline wrote, indexed by path
/// relative to the target root.
#[derive(Debug)]
pub struct Report {
    root: PathBuf,
    entries: BTreeMap<String, ReportEntry>,
}

impl Report {
    /// Start a new, empty report rooted at `root`, which must be absolute.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::Internal(format!("report root must be absolute, got: {}", root.display())));
        }
        Ok(Self { root, entries: BTreeMap::new() })
    }

    /// The target root this report is scoped to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record that `slice` caused `path` (relative to the root, e.g.
    /// `/usr/bin/hello`) to exist with the given shape.
    ///
    /// If this is the first time `path` is recorded, a new entry is created.
    /// If `path` was already recorded with a different mode, link, size, or
    /// hash, this fails with [`Error::DivergingDefinition`]; otherwise `slice`
    /// is simply added to the existing entry's owning set.
    pub fn add(&mut self, slice: SliceKey, path: impl Into<String>, new: NewEntry<'_>) -> Result<()> {
        let path = path.into();
        match self.entries.get_mut(&path) {
            None => {
                let mut slices = BTreeSet::new();
                slices.insert(slice);
                self.entries.insert(
                    path.clone(),
                    ReportEntry {
                        path,
                        mode: new.mode,
                        link: new.link.map(str::to_string),
                        size: new.size,
                        sha256: new.sha256,
                        final_sha256: None,
                        slices,
                    },
                );
                Ok(())
            }
            Some(existing) => {
                if let Some((field, prev, next)) = existing.matches(&new) {
                    return Err(Error::DivergingDefinition { path, field, prev, next });
                }
                existing.slices.insert(slice);
                Ok(())
            }
        }
    }

    /// Record that a mutation script changed `path`'s content, setting its
    /// `final_sha256`. `path` must already be recorded via [`Report::add`].
    pub fn set_final_hash(&mut self, path: &str, hash: [u8; 32]) -> Result<()> {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.final_sha256 = Some(hash);
                Ok(())
            }
            None => Err(Error::Internal(format!("cannot set final hash for unrecorded path: {path}"))),
        }
    }

    /// Look up the entry recorded for `path`, if any.
    pub fn get(&self, path: &str) -> Option<&ReportEntry> {
        self.entries.get(path)
    }

    /// Iterate every recorded entry, in path order.
    pub fn entries(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.values()
    }

    /// How many distinct paths are recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no paths have been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the report as pretty-printed JSON.
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries.values().collect::<Vec<_>>())
            .map_err(|e| Error::Internal(format!("serialize report: {e}")))
    }
}
