#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! `pallet_core` slices a set of Debian packages into a target root
//! filesystem, driven by a declarative selection of named slices: which
//! files to copy, which directories and symlinks to synthesize, and which
//! mutation scripts to run once the tree is populated.
//!
//! The pipeline is five phases, run in order by [`driver::run`]:
//!
//! 1. **Plan** — route every slice's declared content into a per-package
//!    extract map ([`archive::ExtractMap`]).
//! 2. **Extract** — read each package's `.deb` archive once and materialize
//!    every matched entry ([`archive::extract`]).
//! 3. **Synthesize** — create the directories, text files, and symlinks that
//!    have no archive counterpart.
//! 4. **Mutate** — run each slice's `mutate_script`, if any, in a sandboxed
//!    [`rhai`] interpreter gated by the known-paths map ([`content`]).
//! 5. **Finalize** — rehash mutated files and remove everything scheduled
//!    `until: mutate`.
//!
//! Every path the pipeline writes is recorded in a [`report::Report`], which
//! enforces that no two slices disagree about the same path's shape.

pub mod archive;
pub mod content;
pub mod driver;
pub mod error;
pub mod fsops;
pub mod model;
pub mod path;
pub mod report;
mod sandbox;

pub use error::{Error, Result};
pub use model::{
    ArchiveOptions, ArchiveSource, Content as SliceContent, FsArchiveSource, PackageName, PathAttrs, PathInfo, Selection, Slice, SliceKey, SliceName,
    Until,
};
pub use report::{NewEntry, Report, ReportEntry};
