//! Tracks which target paths are "known" (selected into the tree) and which
//! are "mutable", serving the script sandbox's read/write/list predicates.

use std::collections::BTreeMap;

use crate::{
    error::{Error, Result},
    model::Until,
    path::{slashed_clean, slashed_dir},
};

/// Flags recorded for a single known path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathFlags {
    /// Whether a script may overwrite this path's content.
    pub mutable: bool,
    /// Whether this path is scheduled for removal once mutation finishes.
    pub until: Until,
}

/// The known-paths map: every target path the core has committed to the
/// tree, plus the implicit knowledge that every ancestor directory of a
/// known path is itself known (with default flags).
#[derive(Debug, Default, Clone)]
pub struct KnownPaths {
    /// Directories are keyed with a trailing `/`; everything else is keyed
    /// without one. Both forms are cleaned via [`slashed_clean`].
    entries: BTreeMap<String, PathFlags>,
}

impl KnownPaths {
    /// An empty known-paths map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` as known, with the given flags. Also marks every
    /// ancestor directory of `path` as known, with default flags, unless
    /// they're already recorded.
    pub fn mark(&mut self, path: &str, is_dir: bool, flags: PathFlags) {
        let key = Self::key_for(path, is_dir);
        self.mark_ancestors(&key);
        self.entries.insert(key, flags);
    }

    fn mark_ancestors(&mut self, path: &str) {
        let mut dir = slashed_dir(path);
        loop {
            let already_known = self.entries.contains_key(&dir);
            self.entries.entry(dir.clone()).or_insert_with(PathFlags::default);
            if already_known || dir == "/" {
                break;
            }
            dir = slashed_dir(&dir);
        }
    }

    fn key_for(path: &str, is_dir: bool) -> String {
        let cleaned = slashed_clean(path);
        let base = cleaned.trim_end_matches('/');
        if is_dir {
            if base.is_empty() {
                "/".to_string()
            } else {
                format!("{base}/")
            }
        } else {
            base.to_string()
        }
    }

    /// Look up the flags recorded for `path`, trying both the file and
    /// directory forms.
    pub fn flags(&self, path: &str) -> Option<PathFlags> {
        let cleaned = slashed_clean(path);
        let base = cleaned.trim_end_matches('/');
        self.entries
            .get(base)
            .or_else(|| self.entries.get(&format!("{base}/")))
            .or_else(|| if base.is_empty() { self.entries.get("/") } else { None })
            .copied()
    }

    /// Every known path scheduled for `until: mutate` removal, files before
    /// the directories that (might) contain them aren't distinguished here —
    /// callers order removal themselves.
    pub fn until_mutate(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries
            .iter()
            .filter(|(_, flags)| flags.until == Until::Mutate)
            .map(|(path, _)| (path.as_str(), path.ends_with('/')))
    }

    /// Check whether `path` (already cleaned by the caller, with a trailing
    /// slash iff it names a directory) may be read or listed.
    ///
    /// `as_dir` selects whether this is a directory listing (`true`) or a
    /// file read (`false`); the two share the known-paths lookup but differ
    /// in which mismatch/absence message applies.
    pub fn check_read(&self, path: &str, as_dir: bool) -> Result<()> {
        let base = path.trim_end_matches('/');
        let file_known = self.entries.contains_key(base);
        let dir_key = if base.is_empty() { "/".to_string() } else { format!("{base}/") };
        let dir_known = self.entries.contains_key(&dir_key);

        if as_dir {
            if dir_known {
                return Ok(());
            }
            if file_known {
                return Err(Error::SandboxDenied(format!("content is not a directory: {path}")));
            }
            Err(Error::SandboxDenied(format!("cannot list directory which is not selected: {dir_key}")))
        } else {
            if file_known {
                return Ok(());
            }
            if dir_known {
                return Err(Error::SandboxDenied(format!("content is not a file: {path}")));
            }
            Err(Error::SandboxDenied(format!("cannot read file which is not selected: {path}")))
        }
    }

    /// Check whether `path` (already cleaned, no trailing slash) may be
    /// written by a script: it must be known and every owning slice must
    /// have marked it mutable.
    pub fn check_write(&self, path: &str) -> Result<()> {
        match self.entries.get(path) {
            Some(flags) if flags.mutable => Ok(()),
            _ => Err(Error::SandboxDenied(format!("cannot write file which is not mutable: {path}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn marking_a_path_marks_its_ancestors() {
        let mut known = KnownPaths::new();
        known.mark("/usr/bin/hello", false, PathFlags::default());
        assert!(known.flags("/usr/").is_some());
        assert!(known.flags("/usr/bin/").is_some());
        assert!(known.flags("/usr/bin/hello").is_some());
    }

    #[test]
    fn check_read_rejects_unknown_path() {
        let known = KnownPaths::new();
        let err = known.check_read("/tmp/file1", false).unwrap_err();
        assert_eq!(err.to_string(), "cannot read file which is not selected: /tmp/file1");
    }

    #[test]
    fn check_read_distinguishes_file_and_directory() {
        let mut known = KnownPaths::new();
        known.mark("/tmp/file1", false, PathFlags::default());
        let err = known.check_read("/tmp/file1/", true).unwrap_err();
        assert_eq!(err.to_string(), "content is not a directory: /tmp/file1/");
    }

    #[test]
    fn check_write_requires_mutable_flag() {
        let mut known = KnownPaths::new();
        known.mark("/tmp/file1", false, PathFlags { mutable: false, until: Until::None });
        let err = known.check_write("/tmp/file1").unwrap_err();
        assert_eq!(err.to_string(), "cannot write file which is not mutable: /tmp/file1");

        let mut known = KnownPaths::new();
        known.mark("/tmp/file1", false, PathFlags { mutable: true, until: Until::None });
        assert!(known.check_write("/tmp/file1").is_ok());
    }
}
