//! Slashed-path cleaning and glob matching.
//!
//! Every path in this crate is a forward-slashed string relative to (or
//! rooted at) the target directory, never a platform [`std::path::Path`] —
//! this keeps matching behavior identical regardless of host OS and matches
//! how paths are recorded inside Debian package tarballs.

use std::borrow::Cow;

/// Clean a slashed path the way [`clean_str`] does, but preserve whether the
/// input was a directory path (ended in `/`, `/.`, or `/..`) by keeping a
/// trailing slash on the result. Directory paths therefore always end with
/// `/` after cleaning.
///
/// ```
/// use pallet_core::path::slashed_clean;
/// assert_eq!(slashed_clean("/a/b/../c"), "/a/c");
/// assert_eq!(slashed_clean("/a/b/"), "/a/b/");
/// assert_eq!(slashed_clean("/a/b/."), "/a/b/");
/// assert_eq!(slashed_clean("/a/b/.."), "/a/");
/// assert_eq!(slashed_clean("//a//b"), "/a/b");
/// ```
pub fn slashed_clean(p: &str) -> String {
    let wants_trailing_slash = p.ends_with('/') || p.ends_with("/.") || p.ends_with("/..");
    let cleaned = clean_str(p);
    if wants_trailing_slash && !cleaned.ends_with('/') {
        format!("{cleaned}/")
    } else {
        cleaned
    }
}

/// The parent directory of `p`, always ending in `/` (unless it is `/`
/// itself).
///
/// ```
/// use pallet_core::path::slashed_dir;
/// assert_eq!(slashed_dir("/a/b/c"), "/a/b/");
/// assert_eq!(slashed_dir("/a/b/"), "/a/");
/// assert_eq!(slashed_dir("/a"), "/");
/// assert_eq!(slashed_dir("/"), "/");
/// ```
pub fn slashed_dir(p: &str) -> String {
    let cleaned = slashed_clean(p);
    let trimmed = cleaned.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
        None => "/".to_string(),
    }
}

/// Lexically clean a slashed path in the manner of Go's `filepath.Clean`,
/// adapted for `/`-separated paths regardless of host platform: collapse
/// repeated slashes, resolve `.` and `..` segments, and never leave a
/// trailing slash (callers needing one use [`slashed_clean`]).
fn clean_str(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }

    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if let Some(last) = out.last() {
                    if *last != ".." {
                        out.pop();
                        continue;
                    }
                }
                if !rooted {
                    out.push("..");
                }
            }
            seg => out.push(seg),
        }
    }

    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Match `path` against `pattern` using the slicer's wildcard dialect:
/// `?` matches exactly one character that is not `/`, `*` matches zero or
/// more characters that are not `/`, and `**` matches zero or more
/// characters including `/`. Matching is total — the entire string must be
/// consumed.
///
/// ```
/// use pallet_core::path::glob_match;
/// assert!(glob_match("a/*/b", "a/x/b"));
/// assert!(!glob_match("a/*/b", "a/x/y/b"));
/// assert!(glob_match("a/**/b", "a/x/y/b"));
/// assert!(glob_match("/usr/bin/hello", "/usr/bin/hello"));
/// assert!(!glob_match("/usr/bin/hello", "/usr/bin/hallo"));
/// ```
pub fn glob_match(pattern: &str, path: &str) -> bool {
    glob_match::glob_match(pattern, path)
}

/// Returns `true` iff `pattern` contains no wildcard characters, in which
/// case [`glob_match`] degenerates to plain string equality.
pub fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?'])
}

/// Join a parent directory (always `/`-terminated, per [`slashed_dir`]) with
/// a child segment, producing a clean absolute path.
pub fn join(dir: &str, child: &str) -> String {
    if child.is_empty() {
        return slashed_clean(dir);
    }
    let mut joined = String::with_capacity(dir.len() + child.len() + 1);
    joined.push_str(dir);
    if !dir.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(child);
    slashed_clean(&joined)
}

/// Ensure a path ends with a trailing slash, treating it as a directory.
pub fn with_trailing_slash(p: &str) -> Cow<'_, str> {
    if p.ends_with('/') {
        Cow::Borrowed(p)
    } else {
        Cow::Owned(format!("{p}/"))
    }
}
