//! The filesystem primitive: create or remove a single on-disk entry, with
//! mode and parent-directory policy, computing a streaming SHA-256 and size
//! for regular files as they're written.

use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use bon::Builder;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// The kind of entry [`create`] should make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// A directory.
    Directory,
    /// A regular file, populated from `data`.
    Regular,
    /// A symbolic link pointing at `target`.
    Symlink {
        /// The link's target, written verbatim.
        target: String,
    },
    /// A hard link to an existing regular file at `source`.
    HardLink {
        /// The existing file this path should link to.
        source: PathBuf,
    },
}

/// Options for [`create`].
#[derive(Debug, Builder)]
pub struct CreateOptions<'a> {
    /// The absolute path to create.
    pub path: PathBuf,
    /// What to create.
    pub kind: Kind,
    /// Permission bits (masked to `07777`). Ignored for hard links, which
    /// inherit the mode of their source.
    #[builder(default)]
    pub mode: u32,
    /// Content to write, for [`Kind::Regular`].
    #[builder(default)]
    pub data: Option<&'a [u8]>,
    /// Create ancestor directories (at mode `0755`) if they don't exist.
    #[builder(default)]
    pub make_parents: bool,
    /// If the path already exists, overwrite its mode even if the entry
    /// itself doesn't need to change.
    #[builder(default)]
    pub override_mode: bool,
}

/// The result of a successful [`create`].
#[derive(Debug, Clone)]
pub struct Entry {
    /// The path that was created.
    pub path: PathBuf,
    /// The final permission bits.
    pub mode: u32,
    /// For symlinks, the link target; for hard links, the source path.
    pub link: Option<String>,
    /// The SHA-256 of the content, for regular files only.
    pub sha256: Option<[u8; 32]>,
    /// The size in bytes, for regular files only.
    pub size: u64,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// Create or update a single filesystem entry per the rules in the
/// filesystem primitive design: directories keep their existing mode unless
/// `override_mode` is set, files are truncated and rewritten while hashing
/// their content, symlinks are replaced only if their target differs, and
/// hard links no-op if the destination already points at the same inode.
pub fn create(opts: CreateOptions<'_>) -> Result<Entry> {
    if opts.make_parents {
        if let Some(parent) = opts.path.parent() {
            ensure_parents(parent)?;
        }
    }

    match opts.kind {
        Kind::Directory => create_directory(&opts.path, opts.mode, opts.override_mode),
        Kind::Regular => create_regular(&opts.path, opts.mode, opts.data.unwrap_or(&[]), opts.override_mode),
        Kind::Symlink { target } => create_symlink(&opts.path, &target),
        Kind::HardLink { source } => create_hardlink(&opts.path, &source),
    }
}

/// Remove a single entry. Non-empty directories are left alone and this is
/// not an error; missing paths are not an error either.
pub fn remove(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::fs("stat", path, e)),
    };

    if meta.is_dir() {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            // Directory still has children; tolerated so until-mutate
            // removal doesn't depend on a specific traversal order.
            Err(e) if is_dir_not_empty(&e) => Ok(()),
            Err(e) => Err(Error::fs("remove directory", path, e)),
        }
    } else {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs("remove file", path, e)),
        }
    }
}

fn is_dir_not_empty(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOTEMPTY) | Some(libc::EEXIST))
}

/// Create whichever of `dir`'s ancestors (and `dir` itself) don't already
/// exist, each at mode `0755` — never `create_dir_all`, whose single mode
/// argument can't be applied per directory and which would otherwise pick up
/// the process umask for every level it creates.
fn ensure_parents(dir: &Path) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(d) = cursor {
        if d.exists() {
            break;
        }
        missing.push(d);
        cursor = d.parent();
    }

    for d in missing.into_iter().rev() {
        match fs::create_dir(d) {
            Ok(()) => set_mode(d, 0o755)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::fs("create parent directory", d, e)),
        }
    }

    Ok(())
}

fn create_directory(path: &Path, mode: u32, override_mode: bool) -> Result<Entry> {
    match fs::create_dir(path) {
        Ok(()) => {
            set_mode(path, mode)?;
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if override_mode {
                set_mode(path, mode)?;
            }
        }
        Err(e) => return Err(Error::fs("create directory", path, e)),
    }

    let meta = fs::metadata(path).map_err(|e| Error::fs("stat directory", path, e))?;
    Ok(Entry {
        path: path.to_path_buf(),
        mode: meta.permissions().mode() & 0o7777,
        link: None,
        sha256: None,
        size: 0,
        is_dir: true,
    })
}

fn create_regular(path: &Path, mode: u32, data: &[u8], override_mode: bool) -> Result<Entry> {
    let existed = path.symlink_metadata().is_ok();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::fs("create file", path, e))?;

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut writer = HashingWriter {
        inner: &mut file,
        hasher: &mut hasher,
        size: &mut size,
    };
    writer.write_all(data).map_err(|e| Error::fs("write file", path, e))?;
    drop(writer);

    let masked_mode = mode & 0o7777;
    if !existed || override_mode {
        set_mode(path, masked_mode)?;
    }

    let final_meta = fs::metadata(path).map_err(|e| Error::fs("stat file", path, e))?;
    Ok(Entry {
        path: path.to_path_buf(),
        mode: final_meta.permissions().mode() & 0o7777,
        link: None,
        sha256: Some(hasher.finalize().into()),
        size,
        is_dir: false,
    })
}

fn create_symlink(path: &Path, target: &str) -> Result<Entry> {
    if let Ok(existing) = fs::read_link(path) {
        if existing.to_string_lossy() == target {
            return Ok(Entry {
                path: path.to_path_buf(),
                mode: 0o777,
                link: Some(target.to_string()),
                sha256: None,
                size: 0,
                is_dir: false,
            });
        }
        fs::remove_file(path).map_err(|e| Error::fs("replace symlink", path, e))?;
    } else if path.symlink_metadata().is_ok() {
        // A non-symlink entry occupies this path; remove it before linking.
        fs::remove_file(path).map_err(|e| Error::fs("replace non-symlink with symlink", path, e))?;
    }

    std::os::unix::fs::symlink(target, path).map_err(|e| Error::fs("create symlink", path, e))?;
    Ok(Entry {
        path: path.to_path_buf(),
        mode: 0o777,
        link: Some(target.to_string()),
        sha256: None,
        size: 0,
        is_dir: false,
    })
}

fn create_hardlink(path: &Path, source: &Path) -> Result<Entry> {
    let source_meta = fs::metadata(source).map_err(|e| Error::fs("stat hard link source", source, e))?;

    if let Ok(dest_meta) = fs::metadata(path) {
        if dest_meta.ino() == source_meta.ino() && dest_meta.dev() == source_meta.dev() {
            return Ok(Entry {
                path: path.to_path_buf(),
                mode: dest_meta.permissions().mode() & 0o7777,
                link: Some(source.display().to_string()),
                sha256: None,
                size: dest_meta.size(),
                is_dir: false,
            });
        }
        return Err(Error::fs(
            "create hard link: destination exists and points elsewhere",
            path,
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }

    fs::hard_link(source, path).map_err(|e| Error::fs("create hard link", path, e))?;
    Ok(Entry {
        path: path.to_path_buf(),
        mode: source_meta.permissions().mode() & 0o7777,
        link: Some(source.display().to_string()),
        sha256: None,
        size: source_meta.size(),
        is_dir: false,
    })
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| Error::fs("set mode", path, e))
}

/// Hash and count bytes as they pass through, without buffering them.
struct HashingWriter<'a, W> {
    inner: &'a mut W,
    hasher: &'a mut Sha256,
    size: &'a mut u64,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        *self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream a reader's content through a SHA-256 + size proxy without
/// buffering it all in memory, returning the digest and byte count.
pub fn hash_stream(mut reader: impl Read) -> io::Result<([u8; 32], u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().into(), size))
}
