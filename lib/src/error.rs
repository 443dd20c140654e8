//! Typed errors for the slicer pipeline.
//!
//! Each variant corresponds to one of the error kinds in the pipeline design:
//! input misuse caught before any I/O, missing required content, two slices
//! disagreeing about the same path, a sandboxed script overstepping its
//! bounds, an underlying OS or archive failure, or an internal contract
//! violation that indicates a bug in a caller.
//!
//! `Display` renders the literal forms callers and tests match against;
//! changing these strings is a breaking change.

use std::path::PathBuf;

use itertools::Itertools;

/// Errors produced by the slicer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller asked for something that is structurally invalid,
    /// independent of any particular archive or filesystem state.
    #[error("{0}")]
    InputMisuse(String),

    /// One or more non-optional extract targets were never matched
    /// while reading a package's `data.tar.*`.
    #[error("cannot extract from package {package:?}: {}", format_missing(.paths))]
    MissingContent {
        /// The package that was being extracted when the error was detected.
        package: String,
        /// The missing target paths, already in sorted order.
        paths: Vec<String>,
    },

    /// Two slices declared the same target path with differing mode, link,
    /// size, or hash.
    #[error("path {path} requested twice with diverging {field}: {prev} != {next}")]
    DivergingDefinition {
        /// The path both slices declared.
        path: String,
        /// The field that disagreed (`mode`, `link`, `size`, or `sha256`).
        field: &'static str,
        /// The previously recorded value, formatted for display.
        prev: String,
        /// The newly observed value, formatted for display.
        next: String,
    },

    /// A mutation script attempted a read, write, or list outside what the
    /// known-paths map and mutability flags permit.
    #[error("{0}")]
    SandboxDenied(String),

    /// A script's slice context, prefixed per spec as `slice PKG_NAME: `.
    #[error("slice {slice}: {source}")]
    Script {
        /// The textual slice key (`package_slice`) running when the error occurred.
        slice: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// An OS-level call failed. The offending path is attached for context.
    #[error("{context} at {path:?}: {source}")]
    Filesystem {
        /// Short description of the operation that failed (`create`, `remove`, ...).
        context: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The `ar`/tar archive was malformed, used an unsupported compression,
    /// or was missing its `data.tar.*` member.
    #[error("archive error: {0}")]
    Archive(String),

    /// A contract violation by the caller of this library: an internal
    /// invariant that should never be false if the API is used correctly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap this error as having occurred while processing the named slice.
    pub fn in_slice(self, slice: impl Into<String>) -> Self {
        Error::Script {
            slice: slice.into(),
            source: Box::new(self),
        }
    }

    /// Build a [`Error::MissingContent`] from an unsorted set of paths.
    pub fn missing_content(package: impl Into<String>, paths: impl IntoIterator<Item = String>) -> Self {
        Error::MissingContent {
            package: package.into(),
            paths: paths.into_iter().sorted().collect(),
        }
    }

    /// Build a [`Error::Filesystem`] variant from an [`std::io::Error`].
    pub fn fs(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            context,
            path: path.into(),
            source,
        }
    }
}

fn format_missing(paths: &[String]) -> String {
    match paths {
        [single] => format!("no content at {single}"),
        many => format!("no content at:\n{}", many.iter().map(|p| format!("- {p}")).join("\n")),
    }
}

/// Convenience alias for fallible results in this crate.
pub type Result<T> = std::result::Result<T, Error>;
