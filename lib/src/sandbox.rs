//! The script host: evaluates a slice's mutation script in a deterministic,
//! single-threaded [`rhai`] interpreter exposing a single global, `content`,
//! with `read`, `write`, and `list` operations gated by the known-paths map.
//!
//! No other identifier touches the filesystem, spawns a process, or reaches
//! the network — the interpreter's standard library has none of those
//! capabilities to begin with, and `eval` is disabled on top of that.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use rhai::{Array, Engine, EvalAltResult, Position, Scope};

use crate::{
    content::KnownPaths,
    error::{Error, Result},
    path::{self, slashed_clean, slashed_dir, with_trailing_slash},
};

/// A cap on symlink chases per operation, guarding against a cycle of
/// symlinks created by some earlier, unrelated phase.
const MAX_SYMLINK_DEPTH: u32 = 40;

struct Inner {
    root: PathBuf,
    known: KnownPaths,
    mutated: HashSet<String>,
}

/// The `content` global bound into a script's scope. Cheaply [`Clone`]able —
/// every clone shares the same underlying state via an [`Arc`].
#[derive(Clone)]
pub struct Content(Arc<Mutex<Inner>>);

impl Content {
    fn read(&mut self, path: String) -> std::result::Result<String, Box<EvalAltResult>> {
        let inner = self.0.lock().expect("sandbox mutex poisoned");
        let resolved = resolve(&inner.root, &inner.known, &path, false, false).map_err(to_rhai)?;
        drop(inner);
        let bytes = fs::read(&resolved).map_err(|e| to_rhai(Error::fs("read content file", resolved, e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn write(&mut self, path: String, data: String) -> std::result::Result<(), Box<EvalAltResult>> {
        let mut inner = self.0.lock().expect("sandbox mutex poisoned");
        let resolved = resolve(&inner.root, &inner.known, &path, false, true).map_err(to_rhai)?;
        fs::write(&resolved, data.as_bytes()).map_err(|e| to_rhai(Error::fs("write content file", resolved, e)))?;
        inner.mutated.insert(slashed_clean(&path));
        Ok(())
    }

    fn list(&mut self, path: String) -> std::result::Result<Array, Box<EvalAltResult>> {
        let inner = self.0.lock().expect("sandbox mutex poisoned");
        let resolved = resolve(&inner.root, &inner.known, &path, true, false).map_err(to_rhai)?;
        drop(inner);
        let dir = fs::read_dir(&resolved).map_err(|e| to_rhai(Error::fs("list content directory", resolved.clone(), e)))?;
        let mut out = Array::new();
        for entry in dir {
            let entry = entry.map_err(|e| to_rhai(Error::fs("read directory entry", resolved.clone(), e)))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(rhai::Dynamic::from(if is_dir { format!("{name}/") } else { name }));
        }
        Ok(out)
    }
}

fn to_rhai(err: Error) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(err.to_string().into(), Position::NONE))
}

/// Recover the literal message passed to [`to_rhai`], if `err` is a runtime
/// error carrying a plain string payload, rather than rendering it through
/// rhai's own `"Runtime error: ... (line N, position M)"` formatting — the
/// driver's slice-prefixed error text (spec §6) must stay exact.
fn sandbox_message(err: Box<EvalAltResult>) -> String {
    match *err {
        EvalAltResult::ErrorRuntime(dynamic, _) => dynamic.into_string().unwrap_or_else(|_| "script runtime error".to_string()),
        other => other.to_string(),
    }
}

/// Resolve `raw` (as passed to `content.read`/`write`/`list`) to a physical
/// path under `root`, enforcing the absolute-only, no-root-escape, and
/// known-paths rules, chasing symlinks along the way.
fn resolve(root: &Path, known: &KnownPaths, raw: &str, as_dir: bool, for_write: bool) -> Result<PathBuf> {
    if !raw.starts_with('/') {
        return Err(Error::InputMisuse(format!("content path must be absolute, got: {raw}")));
    }

    let mut logical = if as_dir { with_trailing_slash(&slashed_clean(raw)).into_owned() } else { slashed_clean(raw) };
    let mut depth = 0;

    loop {
        if for_write {
            known.check_write(logical.trim_end_matches('/'))?;
        } else {
            known.check_read(&logical, as_dir)?;
        }

        let physical = root.join(logical.trim_start_matches('/'));
        ensure_inside_root(root, &physical, as_dir, raw)?;

        match fs::symlink_metadata(&physical) {
            Ok(meta) if meta.file_type().is_symlink() => {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(Error::SandboxDenied(format!("invalid content symlink: {raw}")));
                }
                let link = fs::read_link(&physical).map_err(|e| Error::fs("read symlink", physical.clone(), e))?;
                let link = link.to_string_lossy();
                let resolved = if link.starts_with('/') {
                    slashed_clean(&link)
                } else {
                    path::join(&slashed_dir(&logical), &link)
                };
                if !resolved.starts_with('/') {
                    return Err(Error::SandboxDenied(format!("invalid content symlink: {raw}")));
                }
                logical = if as_dir { with_trailing_slash(&resolved).into_owned() } else { resolved };
                continue;
            }
            _ => return Ok(physical),
        }
    }
}

fn ensure_inside_root(root: &Path, physical: &Path, as_dir: bool, raw: &str) -> Result<()> {
    let canon_root = root.canonicalize().map_err(|e| Error::fs("canonicalize target root", root, e))?;
    let probe = if as_dir { physical.to_path_buf() } else { physical.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()) };
    let canon_probe = probe.canonicalize().unwrap_or(probe);
    if !canon_probe.starts_with(&canon_root) {
        return Err(Error::SandboxDenied(format!("invalid content path: {raw}")));
    }
    Ok(())
}

/// Run `script` against `root`'s tree, sandboxed by `known`. Returns the set
/// of logical paths the script successfully wrote, for the driver's
/// finalize phase to re-hash.
pub fn run(root: &Path, known: &KnownPaths, script: &str) -> Result<HashSet<String>> {
    let state = Arc::new(Mutex::new(Inner { root: root.to_path_buf(), known: known.clone(), mutated: HashSet::new() }));

    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.set_max_operations(50_000_000);
    engine.set_max_expr_depths(64, 64);
    engine.register_type_with_name::<Content>("Content");
    engine.register_fn("read", Content::read);
    engine.register_fn("write", Content::write);
    engine.register_fn("list", Content::list);

    let mut scope = Scope::new();
    scope.push("content", Content(state.clone()));

    engine
        .eval_with_scope::<rhai::Dynamic>(&mut scope, script)
        .map_err(|e| Error::SandboxDenied(sandbox_message(e)))?;
    drop(scope);

    let inner = Arc::try_unwrap(state)
        .unwrap_or_else(|_| unreachable!("script scope dropped; no other handle to content should remain"))
        .into_inner()
        .expect("sandbox mutex poisoned");
    Ok(inner.mutated)
}
