//! End-to-end scenario tests driving [`pallet_core::driver::run`] against
//! synthetic in-memory packages, covering the canonical scenarios a slicer
//! implementation must get right: full extraction with copy-rename and
//! symlinks, glob matching, missing required content, mutable scripted
//! writes, until-mutate removal, hard links, and sandbox denial.

use std::{collections::BTreeMap, os::unix::fs::MetadataExt, path::Path};

use pallet_core::{driver, Content as SliceContent, PathAttrs, PathInfo, Selection, Slice, Until};
use pretty_assertions::assert_eq;
use sha2::{Digest as _, Sha256};
use tempfile::tempdir;

use crate::fixtures::{build_deb, MemoryArchiveSource, TarEntry};

fn content(info: PathInfo, mutable: bool, until: Until) -> SliceContent {
    SliceContent { info, attrs: PathAttrs { mode: 0, mutable, until, arch: Vec::new() } }
}

fn content_with_mode(info: PathInfo, mode: u32) -> SliceContent {
    SliceContent { info, attrs: PathAttrs { mode, mutable: false, until: Until::None, arch: Vec::new() } }
}

fn slice(package: &str, name: &str, mutate_script: Option<&str>, contents: BTreeMap<String, SliceContent>) -> Slice {
    Slice {
        package: package.to_string(),
        name: name.to_string(),
        essential: Vec::new(),
        mutate_script: mutate_script.map(str::to_string),
        contents,
    }
}

fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[test_log::test]
fn full_tree_copy_rename_symlink_text_and_dir() {
    let package = build_deb(&[
        TarEntry::Dir { path: "/usr/", mode: 0o755 },
        TarEntry::Dir { path: "/usr/bin/", mode: 0o755 },
        TarEntry::File { path: "/usr/bin/hello", mode: 0o755, data: b"hello\n" },
    ]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/usr/bin/hello".to_string(), content(PathInfo::Copy { info: None }, false, Until::None));
    contents.insert(
        "/usr/bin/hallo".to_string(),
        content(PathInfo::Copy { info: Some("/usr/bin/hello".to_string()) }, false, Until::None),
    );
    contents.insert(
        "/bin/hallo".to_string(),
        content(PathInfo::Symlink { target: "../usr/bin/hello".to_string() }, false, Until::None),
    );
    contents.insert("/etc/passwd".to_string(), content(PathInfo::Text { data: "data1".to_string() }, false, Until::None));
    contents.insert("/etc/dir/sub/".to_string(), content_with_mode(PathInfo::Dir, 0o1777));

    let selection = Selection { slices: vec![slice("test-package", "myslice", None, contents)] };

    let root = tempdir().expect("tempdir");
    let report = driver::run(&selection, &source, root.path()).expect("run");

    assert_eq!(std::fs::read(root.path().join("usr/bin/hello")).expect("hello"), b"hello\n");
    assert_eq!(std::fs::read(root.path().join("usr/bin/hallo")).expect("hallo"), b"hello\n");
    assert_eq!(
        report.get("/usr/bin/hello").expect("hello entry").sha256,
        report.get("/usr/bin/hallo").expect("hallo entry").sha256,
        "copy-renamed content must hash identically to its source"
    );

    let link = std::fs::read_link(root.path().join("bin/hallo")).expect("read_link");
    assert_eq!(link, Path::new("../usr/bin/hello"));

    assert_eq!(std::fs::read_to_string(root.path().join("etc/passwd")).expect("passwd"), "data1");

    let sub_mode = std::fs::metadata(root.path().join("etc/dir/sub")).expect("stat sub").mode() & 0o7777;
    assert_eq!(sub_mode, 0o1777);

    for implicit in ["/etc/", "/etc/dir/", "/bin/"] {
        let rel = implicit.trim_start_matches('/').trim_end_matches('/');
        let mode = std::fs::metadata(root.path().join(rel)).expect("stat implicit ancestor").mode() & 0o7777;
        assert_eq!(mode, 0o755, "implicit ancestor {implicit} must default to 0755");
        assert!(report.get(implicit).is_some(), "implicit ancestor {implicit} must be recorded in the report");
    }
}

#[test_log::test]
fn glob_matches_and_inherits_archive_mode() {
    let package = build_deb(&[
        TarEntry::Dir { path: "/usr/", mode: 0o755 },
        TarEntry::Dir { path: "/usr/bin/", mode: 0o700 },
        TarEntry::File { path: "/usr/bin/hello", mode: 0o700, data: b"hi\n" },
    ]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/**/he*o".to_string(), content(PathInfo::Glob, false, Until::None));

    let selection = Selection { slices: vec![slice("test-package", "myslice", None, contents)] };

    let root = tempdir().expect("tempdir");
    driver::run(&selection, &source, root.path()).expect("run");

    assert_eq!(std::fs::read(root.path().join("usr/bin/hello")).expect("hello"), b"hi\n");
    let dir_mode = std::fs::metadata(root.path().join("usr/bin")).expect("stat").mode() & 0o7777;
    assert_eq!(dir_mode, 0o700, "ancestor directory mode must come from the archive");
}

#[test_log::test]
fn missing_required_target_reports_literal_error() {
    let package = build_deb(&[]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/missing-file".to_string(), content(PathInfo::Copy { info: None }, false, Until::None));

    let selection = Selection { slices: vec![slice("test-package", "myslice", None, contents)] };

    let root = tempdir().expect("tempdir");
    let err = driver::run(&selection, &source, root.path()).unwrap_err();
    assert_eq!(err.to_string(), "cannot extract from package \"test-package\": no content at /missing-file");
}

#[test_log::test]
fn mutable_write_updates_final_hash() {
    let package = build_deb(&[]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/tmp/file1".to_string(), content(PathInfo::Text { data: "data1".to_string() }, true, Until::None));

    let selection = Selection {
        slices: vec![slice("test-package", "myslice", Some(r#"content.write("/tmp/file1", "data2");"#), contents)],
    };

    let root = tempdir().expect("tempdir");
    let report = driver::run(&selection, &source, root.path()).expect("run");

    assert_eq!(std::fs::read_to_string(root.path().join("tmp/file1")).expect("file1"), "data2");
    let entry = report.get("/tmp/file1").expect("entry");
    assert_eq!(entry.final_sha256.map(hex::encode), Some(hash_hex(b"data2")));
}

#[test_log::test]
fn until_mutate_removes_file_but_keeps_nonempty_directory() {
    let package = build_deb(&[]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/tmp/file1".to_string(), content(PathInfo::Text { data: "data1".to_string() }, false, Until::Mutate));
    contents.insert("/tmp/keep".to_string(), content(PathInfo::Text { data: "keepme".to_string() }, false, Until::None));
    contents.insert("/foo/file2".to_string(), content(PathInfo::Text { data: String::new() }, true, Until::None));

    let script = r#"
        let x = content.read("/tmp/file1");
        content.write("/foo/file2", x);
    "#;
    let selection = Selection { slices: vec![slice("test-package", "myslice", Some(script), contents)] };

    let root = tempdir().expect("tempdir");
    driver::run(&selection, &source, root.path()).expect("run");

    assert!(!root.path().join("tmp/file1").exists(), "until: mutate path must be removed");
    assert!(root.path().join("tmp").is_dir(), "non-empty directory must survive until-mutate removal");
    assert_eq!(std::fs::read_to_string(root.path().join("tmp/keep")).expect("keep"), "keepme");
    assert_eq!(std::fs::read_to_string(root.path().join("foo/file2")).expect("file2"), "data1");
}

#[test_log::test]
fn script_reading_unselected_path_is_denied() {
    let package = build_deb(&[]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let selection = Selection {
        slices: vec![slice(
            "test-package",
            "myslice",
            Some(r#"content.read("/tmp/file1");"#),
            BTreeMap::new(),
        )],
    };

    let root = tempdir().expect("tempdir");
    let err = driver::run(&selection, &source, root.path()).unwrap_err();
    assert_eq!(err.to_string(), "slice test-package_myslice: cannot read file which is not selected: /tmp/file1");
}

#[test_log::test]
fn hard_link_shares_inode_with_its_source() {
    let package = build_deb(&[
        TarEntry::File { path: "/usr/bin/hello", mode: 0o755, data: b"hello\n" },
        TarEntry::HardLink { path: "/usr/bin/hello2", target: "usr/bin/hello" },
    ]);
    let source = MemoryArchiveSource::new("amd64").insert("test-package", package);

    let mut contents = BTreeMap::new();
    contents.insert("/usr/bin/hello".to_string(), content(PathInfo::Copy { info: None }, false, Until::None));
    contents.insert("/usr/bin/hello2".to_string(), content(PathInfo::Copy { info: None }, false, Until::None));

    let selection = Selection { slices: vec![slice("test-package", "myslice", None, contents)] };

    let root = tempdir().expect("tempdir");
    driver::run(&selection, &source, root.path()).expect("run");

    let a = std::fs::metadata(root.path().join("usr/bin/hello")).expect("stat hello");
    let b = std::fs::metadata(root.path().join("usr/bin/hello2")).expect("stat hello2");
    assert_eq!(a.ino(), b.ino());
    assert_eq!(a.dev(), b.dev());
}
