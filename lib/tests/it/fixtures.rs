//! Builds synthetic, in-memory `.deb` packages (an `ar` archive wrapping a
//! `data.tar.gz` member) so the scenario tests don't need a real Debian
//! mirror, plus a trivial in-memory [`ArchiveSource`] to serve them.

use std::{collections::HashMap, io};

use flate2::{write::GzEncoder, Compression};
use pallet_core::{ArchiveOptions, ArchiveSource, Error, Result};
use tar::{Builder as TarBuilder, EntryType, Header};

/// One tar entry to bake into a synthetic package's `data.tar.gz`.
pub enum TarEntry {
    Dir { path: &'static str, mode: u32 },
    File { path: &'static str, mode: u32, data: &'static [u8] },
    Symlink { path: &'static str, target: &'static str },
    HardLink { path: &'static str, target: &'static str },
}

/// Build the bytes of a minimal Debian binary package containing a
/// `debian-binary` marker and a `data.tar.gz` member built from `entries`.
pub fn build_deb(entries: &[TarEntry]) -> Vec<u8> {
    let mut tar_builder = TarBuilder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for entry in entries {
        match entry {
            TarEntry::Dir { path, mode } => {
                let mut header = Header::new_gnu();
                header.set_path(format!(".{path}")).expect("set dir path");
                header.set_entry_type(EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                header.set_cksum();
                tar_builder.append(&header, io::empty()).expect("append dir");
            }
            TarEntry::File { path, mode, data } => {
                let mut header = Header::new_gnu();
                header.set_path(format!(".{path}")).expect("set file path");
                header.set_entry_type(EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                header.set_cksum();
                tar_builder.append(&header, *data).expect("append file");
            }
            TarEntry::Symlink { path, target } => {
                let mut header = Header::new_gnu();
                header.set_path(format!(".{path}")).expect("set symlink path");
                header.set_entry_type(EntryType::Symlink);
                header.set_link_name(target).expect("set link name");
                header.set_mode(0o777);
                header.set_size(0);
                header.set_cksum();
                tar_builder.append(&header, io::empty()).expect("append symlink");
            }
            TarEntry::HardLink { path, target } => {
                let mut header = Header::new_gnu();
                header.set_path(format!(".{path}")).expect("set hardlink path");
                header.set_entry_type(EntryType::Link);
                header.set_link_name(target).expect("set hardlink target");
                header.set_mode(0o644);
                header.set_size(0);
                header.set_cksum();
                tar_builder.append(&header, io::empty()).expect("append hardlink");
            }
        }
    }

    let gz_encoder = tar_builder.into_inner().expect("finish tar");
    let tar_gz = gz_encoder.finish().expect("finish gzip");

    let mut ar_builder = ar::Builder::new(Vec::new());
    let debian_binary = b"2.0\n";
    ar_builder
        .append(&ar::Header::new(b"debian-binary".to_vec(), debian_binary.len() as u64), &debian_binary[..])
        .expect("append debian-binary");
    ar_builder
        .append(&ar::Header::new(b"data.tar.gz".to_vec(), tar_gz.len() as u64), tar_gz.as_slice())
        .expect("append data.tar.gz");
    ar_builder.into_inner().expect("finish ar")
}

/// An [`ArchiveSource`] backed by an in-memory map of package name to `.deb`
/// bytes, standing in for a real package mirror in tests.
#[derive(Debug, Default)]
pub struct MemoryArchiveSource {
    packages: HashMap<String, Vec<u8>>,
    architecture: String,
}

impl MemoryArchiveSource {
    /// A source reporting `architecture` for every package it's given.
    pub fn new(architecture: impl Into<String>) -> Self {
        Self { packages: HashMap::new(), architecture: architecture.into() }
    }

    /// Register `bytes` (as built by [`build_deb`]) under `package`.
    pub fn insert(mut self, package: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.packages.insert(package.into(), bytes);
        self
    }
}

impl ArchiveSource for MemoryArchiveSource {
    type Reader = io::Cursor<Vec<u8>>;

    fn options(&self, _package: &str) -> Result<ArchiveOptions> {
        Ok(ArchiveOptions { architecture: self.architecture.clone() })
    }

    fn exists(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }

    fn fetch(&self, package: &str) -> Result<Self::Reader> {
        self.packages
            .get(package)
            .cloned()
            .map(io::Cursor::new)
            .ok_or_else(|| Error::Archive(format!("no such package in test fixture: {package}")))
    }
}
