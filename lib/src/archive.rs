//! Reads a Debian binary package (an `ar` archive wrapping `data.tar.*`) and
//! routes its tar entries to on-disk targets according to an extract map of
//! exact paths and globs.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Read,
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    path::{glob_match, slashed_dir, with_trailing_slash},
};

/// One routing target for a source path (exact) or glob pattern.
#[derive(Debug, Clone)]
pub struct ExtractInfo<T> {
    /// The on-disk target path. For globs this always equals the pattern.
    pub target: String,
    /// Desired mode; `0` means "inherit from the archive".
    pub mode: u32,
    /// Whether a missing match for this entry is tolerated.
    pub optional: bool,
    /// Opaque caller context (typically the originating slice).
    pub context: T,
}

/// Routing table from archive source path (or glob pattern) to the targets
/// that consume it.
#[derive(Debug)]
pub struct ExtractMap<T> {
    exact: HashMap<String, Vec<ExtractInfo<T>>>,
    globs: HashMap<String, Vec<ExtractInfo<T>>>,
}

impl<T> Default for ExtractMap<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            globs: HashMap::new(),
        }
    }
}

impl<T> ExtractMap<T> {
    /// A new, empty extract map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `source` (an exact archive path) to `info`.
    pub fn add_exact(&mut self, source: impl Into<String>, info: ExtractInfo<T>) {
        self.exact.entry(source.into()).or_default().push(info);
    }

    /// Route `pattern` (a glob) to `info`. `info.target` must equal
    /// `pattern` and `info.mode` must be `0`; violating either is a
    /// [`Error::InputMisuse`] detected immediately, before any archive is
    /// read.
    pub fn add_glob(&mut self, pattern: impl Into<String>, info: ExtractInfo<T>) -> Result<()> {
        let pattern = pattern.into();
        if info.target != pattern || info.mode != 0 {
            return Err(Error::InputMisuse(format!(
                "when using wildcards source and target paths must match: {pattern}"
            )));
        }
        self.globs.entry(pattern).or_default().push(info);
        Ok(())
    }

    /// Every routed [`ExtractInfo`], across both exact and glob routes, in no
    /// particular order.
    pub fn all_infos(&self) -> impl Iterator<Item = &ExtractInfo<T>> {
        self.exact.values().chain(self.globs.values()).flatten()
    }

    fn pending(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for (source, infos) in &self.exact {
            if infos.iter().any(|i| !i.optional) {
                set.insert(source.clone());
            }
        }
        for (pattern, infos) in &self.globs {
            if infos.iter().any(|i| !i.optional) {
                set.insert(pattern.clone());
            }
        }
        set
    }
}

/// What to create on disk for one routed target.
#[derive(Debug)]
pub enum CreateKind {
    /// A directory.
    Directory,
    /// A regular file with the given content.
    Regular {
        /// The file's content, read from the tar entry.
        data: Vec<u8>,
    },
    /// A symbolic link.
    Symlink {
        /// The link target, as recorded in the tar header.
        target: String,
    },
    /// A hard link to another path within the same archive.
    HardLink {
        /// The normalized archive path of the existing file this links to.
        source: String,
    },
}

/// One creation request passed to the extractor's `create` callback.
#[derive(Debug)]
pub struct CreateRequest {
    /// The target path to create.
    pub target: String,
    /// The resolved mode (archive mode if every matching entry left it at
    /// `0`).
    pub mode: u32,
    /// What kind of entry to create.
    pub kind: CreateKind,
}

/// Read `package_reader`'s outer `ar` archive, locate its `data.tar.{gz,xz,zst}`
/// member, stream its tar entries, and route matches in `map` to `create`.
///
/// `create` is called once per on-disk entry the extractor determines should
/// exist: once per routed target for entries that matched the extract map,
/// and once per ancestor directory implicitly needed along the way (with an
/// empty context slice, per the extractor-driven parent synthesis
/// convention).
pub fn extract<R, T, F>(package: &str, package_reader: R, map: &ExtractMap<T>, mut create: F) -> Result<()>
where
    R: Read,
    F: FnMut(&[&ExtractInfo<T>], CreateRequest) -> Result<()>,
{
    let mut pending = map.pending();
    let mut dir_modes: HashMap<String, u32> = HashMap::new();
    let mut created_dirs: HashSet<String> = HashSet::new();
    let mut found_data_member = false;

    let mut outer = ar::Archive::new(package_reader);
    while let Some(entry) = outer.next_entry() {
        let entry = entry.map_err(|e| Error::Archive(format!("read ar entry: {e}")))?;
        let name = String::from_utf8_lossy(entry.header().identifier()).into_owned();

        let tar_reader: Box<dyn Read + '_> = match name.as_str() {
            "data.tar.gz" => Box::new(flate2::read::GzDecoder::new(entry)),
            "data.tar.xz" => Box::new(xz2::read::XzDecoder::new(entry)),
            "data.tar.zst" => {
                Box::new(zstd::stream::read::Decoder::new(entry).map_err(|e| Error::Archive(format!("init zstd decoder: {e}")))?)
            }
            _ => continue,
        };

        found_data_member = true;
        process_tar(tar_reader, map, &mut pending, &mut dir_modes, &mut created_dirs, &mut create)?;
        break;
    }

    if !found_data_member {
        return Err(Error::Archive(format!(
            "package {package:?} has no data.tar.gz, data.tar.xz, or data.tar.zst member"
        )));
    }

    if !pending.is_empty() {
        return Err(Error::missing_content(package, pending));
    }

    Ok(())
}

fn process_tar<R, T, F>(
    reader: R,
    map: &ExtractMap<T>,
    pending: &mut HashSet<String>,
    dir_modes: &mut HashMap<String, u32>,
    created_dirs: &mut HashSet<String>,
    create: &mut F,
) -> Result<()>
where
    R: Read,
    F: FnMut(&[&ExtractInfo<T>], CreateRequest) -> Result<()>,
{
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| Error::Archive(format!("read tar entries: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Archive(format!("read tar entry: {e}")))?;
        let is_dir = entry.header().entry_type().is_dir();
        let is_symlink = entry.header().entry_type().is_symlink();
        let is_hard_link = entry.header().entry_type().is_hard_link();
        let archive_mode = entry.header().mode().unwrap_or(0) & 0o7777;

        let raw_path = entry.path().map_err(|e| Error::Archive(format!("read tar entry path: {e}")))?.to_string_lossy().into_owned();
        let Some(norm) = normalize_archive_path(&raw_path, is_dir) else {
            continue;
        };

        if is_dir {
            dir_modes.insert(norm.clone(), archive_mode);
        }

        let (infos, is_glob) = match map.exact.get(&norm) {
            Some(v) => (v, false),
            None => {
                let hit = map.globs.iter().find(|(pattern, _)| glob_match(pattern, &norm));
                match hit {
                    Some((pattern, v)) => {
                        pending.remove(pattern);
                        (v, true)
                    }
                    None => continue,
                }
            }
        };
        if !is_glob {
            pending.remove(&norm);
        }

        // For glob matches, `info.target` is the *pattern* (enforced equal to
        // it at registration time), not a real path — the actual on-disk
        // target is always the matched archive path itself, since globs can
        // never rename (source and target are the same path by definition).
        let mut by_target: BTreeMap<&str, Vec<&ExtractInfo<T>>> = BTreeMap::new();
        for info in infos {
            let key = if is_glob { norm.as_str() } else { info.target.as_str() };
            by_target.entry(key).or_default().push(info);
        }

        let link_target = if is_symlink {
            let link = entry
                .link_name()
                .map_err(|e| Error::Archive(format!("read symlink target for {norm}: {e}")))?
                .ok_or_else(|| Error::Archive(format!("symlink {norm} has no recorded target")))?;
            Some(link.to_string_lossy().into_owned())
        } else {
            None
        };

        let hard_link_source = if is_hard_link {
            let link = entry
                .link_name()
                .map_err(|e| Error::Archive(format!("read hard link source for {norm}: {e}")))?
                .ok_or_else(|| Error::Archive(format!("hard link {norm} has no recorded source")))?
                .to_string_lossy()
                .into_owned();
            normalize_archive_path(&link, false)
        } else {
            None
        };

        let buffered_body: Option<Vec<u8>> = if !is_dir && link_target.is_none() && hard_link_source.is_none() && by_target.len() > 1 {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| Error::fs("read tar entry body", norm.clone(), e))?;
            Some(buf)
        } else {
            None
        };

        for (target, group) in by_target {
            let mode = resolve_mode(&group, archive_mode)?;
            ensure_ancestors(target, dir_modes, created_dirs, create)?;

            let kind = if is_dir {
                created_dirs.insert(target.to_string());
                CreateKind::Directory
            } else if let Some(link) = &link_target {
                CreateKind::Symlink { target: link.clone() }
            } else if let Some(source) = &hard_link_source {
                CreateKind::HardLink { source: source.clone() }
            } else {
                let data = match &buffered_body {
                    Some(b) => b.clone(),
                    None => {
                        let mut b = Vec::new();
                        entry.read_to_end(&mut b).map_err(|e| Error::fs("read tar entry body", target, e))?;
                        b
                    }
                };
                CreateKind::Regular { data }
            };

            debug!(target, mode, is_glob, "route tar entry");
            create(&group, CreateRequest { target: target.to_string(), mode, kind })?;
        }
    }

    Ok(())
}

fn resolve_mode<T>(group: &[&ExtractInfo<T>], archive_mode: u32) -> Result<u32> {
    let mut resolved: Option<u32> = None;
    for info in group {
        if info.mode == 0 {
            continue;
        }
        match resolved {
            None => resolved = Some(info.mode),
            Some(prev) if prev != info.mode => {
                return Err(Error::DivergingDefinition {
                    path: info.target.clone(),
                    field: "mode",
                    prev: format!("{prev:04o}"),
                    next: format!("{:04o}", info.mode),
                });
            }
            _ => {}
        }
    }
    Ok(resolved.unwrap_or(archive_mode))
}

fn ensure_ancestors<T, F>(
    target: &str,
    dir_modes: &mut HashMap<String, u32>,
    created_dirs: &mut HashSet<String>,
    create: &mut F,
) -> Result<()>
where
    F: FnMut(&[&ExtractInfo<T>], CreateRequest) -> Result<()>,
{
    let mut chain = Vec::new();
    let mut dir = slashed_dir(target);
    while dir != "/" {
        chain.push(dir.clone());
        dir = slashed_dir(&dir);
    }
    chain.reverse();

    for dir in chain {
        if created_dirs.contains(&dir) {
            continue;
        }
        let mode = dir_modes.remove(&dir).unwrap_or(0o755);
        create(&[], CreateRequest { target: dir.clone(), mode, kind: CreateKind::Directory })?;
        created_dirs.insert(dir);
    }

    Ok(())
}

/// Normalize a raw archive path (`./x`, `x`, or `/x`) into an absolute,
/// cleaned path. Returns `None` for `.`-only or empty entries, which are
/// skipped. Directory entries always come back `/`-terminated.
fn normalize_archive_path(raw: &str, is_dir: bool) -> Option<String> {
    if raw.is_empty() || raw == "." || raw == "./" {
        return None;
    }
    let trimmed = raw.strip_prefix("./").unwrap_or(raw);
    if trimmed.is_empty() {
        return None;
    }
    let abs = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    let cleaned = crate::path::slashed_clean(&abs);
    Some(if is_dir {
        with_trailing_slash(&cleaned).into_owned()
    } else {
        cleaned
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_strips_dot_slash_prefix() {
        assert_eq!(normalize_archive_path("./usr/bin/hello", false), Some("/usr/bin/hello".to_string()));
    }

    #[test]
    fn normalize_skips_dot_only_entries() {
        assert_eq!(normalize_archive_path(".", false), None);
        assert_eq!(normalize_archive_path("./", true), None);
        assert_eq!(normalize_archive_path("", false), None);
    }

    #[test]
    fn normalize_keeps_directory_trailing_slash() {
        assert_eq!(normalize_archive_path("./usr/bin", true), Some("/usr/bin/".to_string()));
    }

    #[test]
    fn add_glob_rejects_mismatched_target() {
        let mut map: ExtractMap<()> = ExtractMap::new();
        let err = map
            .add_glob(
                "/**/he*o",
                ExtractInfo {
                    target: "/other".to_string(),
                    mode: 0,
                    optional: false,
                    context: (),
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "when using wildcards source and target paths must match: /**/he*o");
    }

    #[test]
    fn add_glob_rejects_nonzero_mode() {
        let mut map: ExtractMap<()> = ExtractMap::new();
        let err = map
            .add_glob(
                "/**/he*o",
                ExtractInfo {
                    target: "/**/he*o".to_string(),
                    mode: 0o644,
                    optional: false,
                    context: (),
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "when using wildcards source and target paths must match: /**/he*o");
    }

    #[test]
    fn resolve_mode_detects_divergence() {
        let a = ExtractInfo { target: "/x".to_string(), mode: 0o644, optional: false, context: () };
        let b = ExtractInfo { target: "/x".to_string(), mode: 0o600, optional: false, context: () };
        let err = resolve_mode(&[&a, &b], 0o755).unwrap_err();
        assert_eq!(err.to_string(), "path /x requested twice with diverging mode: 0644 != 0600");
    }

    #[test]
    fn resolve_mode_falls_back_to_archive_mode() {
        let a = ExtractInfo { target: "/x".to_string(), mode: 0, optional: false, context: () };
        assert_eq!(resolve_mode(&[&a], 0o755).unwrap(), 0o755);
    }
}
