//! Orchestrates the full pipeline: build per-package extract maps, drive
//! extraction, synthesize non-extracted content, run mutation scripts in
//! dependency order, perform until-mutate removal, and populate the
//! [`Report`].

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use tracing::{debug, instrument, warn};

use crate::{
    archive::{self, CreateKind, CreateRequest, ExtractInfo, ExtractMap},
    content::{KnownPaths, PathFlags},
    error::{Error, Result},
    fsops::{self, CreateOptions, Kind},
    model::{ArchiveSource, PathInfo, Selection, Slice, SliceKey, Until},
    path::slashed_dir,
    report::{NewEntry, Report},
    sandbox,
};

/// Run the full slicer pipeline for `selection` against `source`, writing
/// into `root` (which must already exist and, per spec, is assumed empty or
/// disposable on failure — this function does not roll back partial output).
#[instrument(skip(selection, source), fields(root = %root.display(), slices = selection.iter().count()))]
pub fn run(selection: &Selection, source: &impl ArchiveSource, root: &Path) -> Result<Report> {
    let mut report = Report::new(root)?;
    let mut known = KnownPaths::new();

    let _umask = UmaskGuard::acquire();

    let (package_order, extract_maps, architectures) = plan(selection, source)?;
    extract(&package_order, &extract_maps, &architectures, source, root, &mut report, &mut known)?;
    synthesize(selection, &architectures, root, &mut report, &mut known)?;
    let mutated = mutate(selection, root, &known)?;
    finalize(root, &known, &mutated, &mut report)?;

    Ok(report)
}

/// Context carried alongside each [`ExtractInfo`] routed into a package's
/// extract map: which slice asked for this, the mutability/removal flags it
/// declared (irrelevant for preservation-only routes), and whether this
/// route exists purely to preserve an archive mode rather than because a
/// slice actually selected this exact path.
#[derive(Debug, Clone)]
struct RouteContext {
    slice: SliceKey,
    mutable: bool,
    until: Until,
    synthetic: bool,
}

type Map = ExtractMap<RouteContext>;

/// Phase 1: build one extract map per package, in Selection order, and
/// record each package's declared architecture and the ordered list of
/// slices that contribute to it (used to attribute implicit ancestor
/// directories in the Report).
#[instrument(skip(selection, source))]
fn plan(selection: &Selection, source: &impl ArchiveSource) -> Result<(Vec<String>, HashMap<String, Map>, HashMap<String, String>)> {
    let mut package_order = Vec::new();
    let mut maps: HashMap<String, Map> = HashMap::new();
    let mut architectures: HashMap<String, String> = HashMap::new();

    for slice in selection.iter() {
        if !architectures.contains_key(&slice.package) {
            let opts = source.options(&slice.package)?;
            architectures.insert(slice.package.clone(), opts.architecture);
            package_order.push(slice.package.clone());
        }
        let arch = architectures[&slice.package].clone();
        let map = maps.entry(slice.package.clone()).or_default();
        plan_slice(slice, &arch, map)?;
    }

    Ok((package_order, maps, architectures))
}

fn plan_slice(slice: &Slice, arch: &str, map: &mut Map) -> Result<()> {
    let key = slice.key();
    let copyright = copyright_path(&slice.package);
    let mut has_copyright = false;

    for (target, content) in &slice.contents {
        if target == &copyright {
            has_copyright = true;
        }
        if !content.applies_to(arch) {
            continue;
        }

        let route_ctx = RouteContext { slice: key.clone(), mutable: content.attrs.mutable, until: content.attrs.until, synthetic: false };

        match &content.info {
            PathInfo::Copy { info } => {
                let source = info.clone().unwrap_or_else(|| target.clone());
                map.add_exact(source, ExtractInfo { target: target.clone(), mode: content.attrs.mode, optional: false, context: route_ctx });
            }
            PathInfo::Glob => {
                map.add_glob(target.clone(), ExtractInfo { target: target.clone(), mode: 0, optional: false, context: route_ctx })?;
            }
            PathInfo::Dir | PathInfo::Text { .. } | PathInfo::Symlink { .. } => {
                let parent = slashed_dir(target);
                let preserve_ctx = RouteContext { slice: key.clone(), mutable: false, until: Until::None, synthetic: true };
                map.add_exact(parent.clone(), ExtractInfo { target: parent, mode: 0, optional: true, context: preserve_ctx });
            }
            PathInfo::Generate => {
                warn!(target, "generate content kind is reserved for out-of-core producers; skipping");
            }
        }
    }

    if !has_copyright {
        let ctx = RouteContext { slice: key, mutable: false, until: Until::None, synthetic: true };
        map.add_exact(copyright.clone(), ExtractInfo { target: copyright, mode: 0, optional: true, context: ctx });
    }

    Ok(())
}

fn copyright_path(package: &str) -> String {
    format!("/usr/share/doc/{package}/copyright")
}

/// Phase 2: run the archive extractor against every package, in Selection
/// order, materializing each matched entry and recording it in both the
/// known-paths map and the report.
#[instrument(skip(package_order, maps, architectures, source, report, known))]
fn extract(
    package_order: &[String],
    maps: &HashMap<String, Map>,
    architectures: &HashMap<String, String>,
    source: &impl ArchiveSource,
    root: &Path,
    report: &mut Report,
    known: &mut KnownPaths,
) -> Result<()> {
    for package in package_order {
        let _ = architectures.get(package);
        let Some(map) = maps.get(package) else { continue };
        let reader = source.fetch(package)?;
        let package_slices = owning_slices(map);

        archive::extract(package, reader, map, |group, request| {
            materialize(root, group, request, &package_slices, report, known)
        })?;
    }
    Ok(())
}

/// Every slice (in first-seen order) that contributes at least one route to
/// this package's extract map — used to attribute implicitly-synthesized
/// ancestor directories in the report, since no single slice "owns" a
/// directory created only because something beneath it needed a parent.
fn owning_slices(map: &Map) -> Vec<SliceKey> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for info in map.all_infos() {
        if seen.insert(info.context.slice.clone()) {
            out.push(info.context.slice.clone());
        }
    }
    out
}

fn materialize(
    root: &Path,
    group: &[&ExtractInfo<RouteContext>],
    request: CreateRequest,
    package_slices: &[SliceKey],
    report: &mut Report,
    known: &mut KnownPaths,
) -> Result<()> {
    let is_dir = matches!(request.kind, CreateKind::Directory);
    let rel = request.target.clone();
    let abs = root.join(rel.trim_start_matches('/'));
    let mode = request.mode;

    let (kind, data) = match request.kind {
        CreateKind::Directory => (Kind::Directory, None),
        CreateKind::Regular { data } => (Kind::Regular, Some(data)),
        CreateKind::Symlink { target } => (Kind::Symlink { target }, None),
        CreateKind::HardLink { source } => (Kind::HardLink { source: root.join(source.trim_start_matches('/')) }, None),
    };

    let entry = fsops::create(CreateOptions::builder().path(abs).kind(kind).mode(mode).maybe_data(data.as_deref()).make_parents(true).build())?;

    let new_entry = NewEntry { mode: entry.mode, link: entry.link.as_deref(), size: entry.size, sha256: entry.sha256 };

    if group.is_empty() {
        for slice in package_slices {
            report.add(slice.clone(), rel.clone(), new_entry)?;
        }
        return Ok(());
    }

    let real = group.iter().filter(|i| !i.context.synthetic);
    if real.clone().count() > 0 {
        let mutable = real.clone().all(|i| i.context.mutable);
        let until = if real.clone().all(|i| i.context.until == Until::Mutate) { Until::Mutate } else { Until::None };
        known.mark(&rel, is_dir, PathFlags { mutable, until });
    }

    for info in group {
        report.add(info.context.slice.clone(), rel.clone(), new_entry)?;
    }
    Ok(())
}

/// Phase 3: synthesize `dir`, `text`, and `symlink` content that the
/// extractor does not produce, in Selection order, skipping targets already
/// synthesized by an earlier slice in the same pass.
#[instrument(skip(selection, architectures, report, known))]
fn synthesize(selection: &Selection, architectures: &HashMap<String, String>, root: &Path, report: &mut Report, known: &mut KnownPaths) -> Result<()> {
    let mut done: HashSet<String> = HashSet::new();
    let mut created_dirs: HashSet<String> = HashSet::new();

    for slice in selection.iter() {
        let arch = architectures.get(&slice.package).map(String::as_str).unwrap_or_default();
        for (target, content) in &slice.contents {
            if !content.info.is_synthesized() || !content.applies_to(arch) || done.contains(target) {
                continue;
            }

            ensure_synthesized_ancestors(target, &slice.key(), root, report, known, &mut created_dirs)?;

            let is_dir = matches!(content.info, PathInfo::Dir);
            let abs = root.join(target.trim_start_matches('/'));
            let mode = content.effective_mode();

            let kind = match &content.info {
                PathInfo::Dir => Kind::Directory,
                PathInfo::Text { .. } => Kind::Regular,
                PathInfo::Symlink { target: link } => Kind::Symlink { target: link.clone() },
                _ => unreachable!("filtered to synthesized kinds above"),
            };
            let data = match &content.info {
                PathInfo::Text { data } => Some(data.as_bytes()),
                _ => None,
            };

            let entry = fsops::create(CreateOptions::builder().path(abs).kind(kind).mode(mode).maybe_data(data).make_parents(false).build())?;

            known.mark(target, is_dir, PathFlags { mutable: content.attrs.mutable, until: content.attrs.until });
            let new_entry = NewEntry { mode: entry.mode, link: entry.link.as_deref(), size: entry.size, sha256: entry.sha256 };
            report.add(slice.key(), target.clone(), new_entry)?;
            done.insert(target.clone());
            debug!(target, "synthesized");
        }
    }

    Ok(())
}

/// Walk `target`'s ancestor chain, creating (at mode 0755, per spec's default
/// for synthesized directories) whichever prefix directories don't already
/// have a disk entry, and recording each freshly-created one in the report
/// against `slice`. An ancestor the extract phase already materialized (and
/// so already has a report entry) is left untouched — we don't re-derive its
/// mode, and we don't re-add it under a second owner.
fn ensure_synthesized_ancestors(
    target: &str,
    slice: &SliceKey,
    root: &Path,
    report: &mut Report,
    known: &mut KnownPaths,
    created_dirs: &mut HashSet<String>,
) -> Result<()> {
    let mut chain = Vec::new();
    let mut dir = slashed_dir(target);
    while dir != "/" {
        chain.push(dir.clone());
        dir = slashed_dir(&dir);
    }
    chain.reverse();

    for dir in chain {
        if created_dirs.contains(&dir) || report.get(&dir).is_some() {
            created_dirs.insert(dir);
            continue;
        }

        let abs = root.join(dir.trim_start_matches('/'));
        let entry = fsops::create(CreateOptions::builder().path(abs).kind(Kind::Directory).mode(0o755).make_parents(true).build())?;

        known.mark(&dir, true, PathFlags::default());
        let new_entry = NewEntry { mode: entry.mode, link: entry.link.as_deref(), size: entry.size, sha256: entry.sha256 };
        report.add(slice.clone(), dir.clone(), new_entry)?;
        created_dirs.insert(dir);
    }

    Ok(())
}

/// Phase 4: run every slice's mutation script, in Selection order, against a
/// sandbox bound to `root` and `known`. Returns the union of paths every
/// script successfully wrote.
#[instrument(skip(selection, known))]
fn mutate(selection: &Selection, root: &Path, known: &KnownPaths) -> Result<HashSet<String>> {
    let mut mutated = HashSet::new();
    for slice in selection.iter() {
        let Some(script) = slice.mutate_script.as_deref().filter(|s| !s.is_empty()) else { continue };
        let written = sandbox::run(root, known, script).map_err(|e| e.in_slice(slice.textual_key()))?;
        mutated.extend(written);
    }
    Ok(mutated)
}

/// Phase 5: for every mutated regular file whose on-disk content now differs
/// from its recorded hash, set `final_sha256`; then remove every path
/// scheduled `until: mutate`, files before directories, directories
/// longest-path-first so empty parents can disappear after their children.
#[instrument(skip(root, known, mutated, report))]
fn finalize(root: &Path, known: &KnownPaths, mutated: &HashSet<String>, report: &mut Report) -> Result<()> {
    for path in mutated {
        let abs = root.join(path.trim_start_matches('/'));
        let Ok(file) = std::fs::File::open(&abs) else { continue };
        let (hash, _size) = fsops::hash_stream(file).map_err(|e| Error::fs("rehash mutated file", abs, e))?;
        if report.get(path).map(|e| e.sha256) != Some(Some(hash)) {
            report.set_final_hash(path, hash)?;
        }
    }

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for (path, is_dir) in known.until_mutate() {
        if is_dir {
            dirs.push(path.to_string());
        } else {
            files.push(path.to_string());
        }
    }

    for path in files {
        fsops::remove(&root.join(path.trim_start_matches('/')))?;
    }

    dirs.sort_by_key(|p| std::cmp::Reverse(p.len()));
    for path in dirs {
        fsops::remove(&root.join(path.trim_start_matches('/')))?;
    }

    Ok(())
}

/// Sets the process umask to `0` for the scope of the guard, restoring the
/// previous value on every exit path (including unwinding), so that modes
/// recorded by slices reach disk verbatim.
struct UmaskGuard(libc::mode_t);

impl UmaskGuard {
    #[allow(unsafe_code)]
    fn acquire() -> Self {
        let previous = unsafe { libc::umask(0) };
        Self(previous)
    }
}

impl Drop for UmaskGuard {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.0);
        }
    }
}
