//! The data model: slices, selections, and the small trait seam the driver
//! uses to reach package archives.
//!
//! Everything here is plain data (or a narrow trait); the interesting
//! behavior lives in [`crate::archive`], [`crate::content`], [`crate::driver`],
//! and the crate-private sandbox module.

use std::{collections::BTreeMap, fmt, io::Read, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A package name, matching `[a-z0-9]([-.a-z0-9+]){1,}`.
pub type PackageName = String;

/// A slice name, matching `[a-z]([-a-z0-9]){2,}`.
pub type SliceName = String;

/// Identifies a slice by the package that defines it and the slice's own
/// name within that package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceKey {
    /// The package defining this slice.
    pub package: PackageName,
    /// The slice's name within the package.
    pub slice: SliceName,
}

impl SliceKey {
    /// Construct a key directly.
    pub fn new(package: impl Into<PackageName>, slice: impl Into<SliceName>) -> Self {
        Self {
            package: package.into(),
            slice: slice.into(),
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.package, self.slice)
    }
}

/// Validate a package name against `[a-z0-9]([-.a-z0-9+]){1,}`.
pub fn validate_package_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.clone().count() >= 1
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '+'));
    if valid {
        Ok(())
    } else {
        Err(Error::InputMisuse(format!("invalid package name: {name}")))
    }
}

/// Validate a slice name against `[a-z]([-a-z0-9]){2,}`.
pub fn validate_slice_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.clone().count() >= 2
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InputMisuse(format!("invalid slice name: {name}")))
    }
}

/// Whether a path should be removed once the mutation phase completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Until {
    /// No scheduled removal; the path is permanent.
    #[default]
    None,
    /// Remove the path after phase 4 (mutation), tolerating non-empty
    /// directories.
    Mutate,
}

/// One entry in a slice's `contents` map, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathInfo {
    /// Extract a single archive path to the target (possibly renamed).
    Copy {
        /// Source path inside the package's `data.tar.*`, if different from
        /// the target.
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    /// Extract every archive path matching a wildcard; source and target are
    /// always identical and mode is always inherited from the archive.
    Glob,
    /// Synthesize a directory; the target path must end with `/`.
    Dir,
    /// Synthesize a regular file with the given literal content.
    Text {
        /// The file's literal byte content.
        data: String,
    },
    /// Synthesize a symbolic link pointing at the given target.
    Symlink {
        /// The link's target, as written verbatim to disk.
        target: String,
    },
    /// Reserved for out-of-core producers; the path must end with `/**`.
    Generate,
}

impl PathInfo {
    /// The mode used when `0` ("inherit") is declared for this kind:
    /// `0755` for directories, `0644` for other synthesized content, and `0`
    /// (meaning "use the archive's mode") for extracted content.
    pub fn default_mode(&self) -> u32 {
        match self {
            PathInfo::Dir => 0o755,
            PathInfo::Text { .. } | PathInfo::Symlink { .. } => 0o644,
            PathInfo::Copy { .. } | PathInfo::Glob | PathInfo::Generate => 0,
        }
    }

    /// Whether this kind is synthesized directly by the driver (phase 3)
    /// rather than routed through the archive extractor (phase 2).
    pub fn is_synthesized(&self) -> bool {
        matches!(self, PathInfo::Dir | PathInfo::Text { .. } | PathInfo::Symlink { .. })
    }
}

/// Attributes shared by every `contents` entry, independent of its kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathAttrs {
    /// Octal mode; `0` means "inherit" (from the archive, or the kind's
    /// default for synthesized content).
    #[serde(default)]
    pub mode: u32,
    /// Whether a script is permitted to overwrite this path's content.
    /// Only meaningful for regular files.
    #[serde(default)]
    pub mutable: bool,
    /// Whether this path is scheduled for removal after mutation.
    #[serde(default)]
    pub until: Until,
    /// Architectures this entry applies to; empty means "all".
    #[serde(default)]
    pub arch: Vec<String>,
}

/// One entry in a slice's `contents` map: the synthesis/extraction kind
/// plus shared attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// What this entry is and how to produce it.
    #[serde(flatten)]
    pub info: PathInfo,
    /// Shared attributes (mode, mutability, removal schedule, arch filter).
    #[serde(flatten)]
    pub attrs: PathAttrs,
}

impl Content {
    /// The effective mode for this entry: the declared mode if non-zero,
    /// else the kind's default.
    pub fn effective_mode(&self) -> u32 {
        if self.attrs.mode != 0 {
            self.attrs.mode
        } else {
            self.info.default_mode()
        }
    }

    /// Whether this entry applies to the given architecture.
    pub fn applies_to(&self, arch: &str) -> bool {
        self.attrs.arch.is_empty() || self.attrs.arch.iter().any(|a| a == arch)
    }
}

/// A slice: a declarative, named subset of a package's files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    /// The package this slice belongs to.
    pub package: PackageName,
    /// This slice's name within its package.
    pub name: SliceName,
    /// Other slices (by key) this slice depends on; already expected to be
    /// transitively included and topologically ordered in any [`Selection`].
    #[serde(default)]
    pub essential: Vec<SliceKey>,
    /// The slice's mutation script source, if any.
    #[serde(default)]
    pub mutate_script: Option<String>,
    /// Target path -> content declaration.
    pub contents: BTreeMap<String, Content>,
}

impl Slice {
    /// This slice's key.
    pub fn key(&self) -> SliceKey {
        SliceKey::new(self.package.clone(), self.name.clone())
    }

    /// This slice's textual key, e.g. `base-files_myslice`.
    pub fn textual_key(&self) -> String {
        self.key().to_string()
    }
}

/// An ordered sequence of slices with transitive dependencies already
/// included. The order is a topological sort, used both for extraction
/// order and mutation script execution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selection {
    /// The slices to process, in dependency order.
    pub slices: Vec<Slice>,
}

impl Selection {
    /// Iterate the slices in order.
    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }
}

/// Options describing an archive, as reported by an [`ArchiveSource`].
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// The Debian architecture string (e.g. `amd64`) this archive was built
    /// for.
    pub architecture: String,
}

/// Abstracts interaction with Debian package archives.
///
/// Mirrors the shape of a typical "pull layer content" trait: a handful of
/// narrow accessor methods that return [`Result`], leaving authentication,
/// caching, and transport entirely to the implementation. The slicer driver
/// only ever calls these three methods.
pub trait ArchiveSource {
    /// The concrete reader type returned by [`ArchiveSource::fetch`].
    type Reader: Read;

    /// Report the options (currently just the architecture) for a package.
    fn options(&self, package: &str) -> Result<ArchiveOptions>;

    /// Whether this source has an archive for the named package.
    fn exists(&self, package: &str) -> bool;

    /// Open a reader over the named package's outer `ar` archive.
    fn fetch(&self, package: &str) -> Result<Self::Reader>;
}

/// A filesystem-backed [`ArchiveSource`] reading `<dir>/<package>.deb` files.
///
/// This is a minimal stand-in for the out-of-core package-fetching
/// collaborator (which would handle HTTP, release index verification, and
/// caching); it exists so the CLI and test suite have something concrete to
/// exercise the driver against.
#[derive(Debug, Clone)]
pub struct FsArchiveSource {
    root: Arc<std::path::PathBuf>,
    architecture: String,
}

impl FsArchiveSource {
    /// Create a new source rooted at `dir`, reporting `architecture` for
    /// every package it serves.
    pub fn new(dir: impl Into<std::path::PathBuf>, architecture: impl Into<String>) -> Self {
        Self {
            root: Arc::new(dir.into()),
            architecture: architecture.into(),
        }
    }

    fn path_for(&self, package: &str) -> std::path::PathBuf {
        self.root.join(format!("{package}.deb"))
    }
}

impl ArchiveSource for FsArchiveSource {
    type Reader = std::fs::File;

    fn options(&self, _package: &str) -> Result<ArchiveOptions> {
        Ok(ArchiveOptions {
            architecture: self.architecture.clone(),
        })
    }

    fn exists(&self, package: &str) -> bool {
        self.path_for(package).is_file()
    }

    fn fetch(&self, package: &str) -> Result<Self::Reader> {
        let path = self.path_for(package);
        std::fs::File::open(&path).map_err(|e| Error::fs("open package archive", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slice_key_display() {
        let key = SliceKey::new("base-files", "myslice");
        assert_eq!(key.to_string(), "base-files_myslice");
    }

    #[test]
    fn package_name_validation() {
        assert!(validate_package_name("base-files").is_ok());
        assert!(validate_package_name("libc6").is_ok());
        assert!(validate_package_name("A").is_err());
        assert!(validate_package_name("").is_err());
    }

    #[test]
    fn slice_name_validation() {
        assert!(validate_slice_name("myslice").is_ok());
        assert!(validate_slice_name("ab").is_err());
        assert!(validate_slice_name("1bc").is_err());
    }

    #[test]
    fn content_effective_mode_prefers_declared() {
        let content = Content {
            info: PathInfo::Dir,
            attrs: PathAttrs {
                mode: 0o1777,
                ..Default::default()
            },
        };
        assert_eq!(content.effective_mode(), 0o1777);
    }

    #[test]
    fn content_effective_mode_falls_back_to_kind_default() {
        let content = Content {
            info: PathInfo::Dir,
            attrs: PathAttrs::default(),
        };
        assert_eq!(content.effective_mode(), 0o755);
    }
}
