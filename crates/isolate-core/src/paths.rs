//! Path helpers: posix conversion, lexical normalization and rebasing.
//!
//! Dependency lists always use `/` while directories (`isolate_dir`,
//! `root_dir`) use the native separator.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

/// Render a relative path with `/` separators.
pub fn to_posix(path: &Path) -> String {
    let s = path.to_string_lossy();
    if MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(MAIN_SEPARATOR, "/")
    }
}

/// Convert a posix relative path to the native separator.
pub fn from_posix(path: &str) -> PathBuf {
    if MAIN_SEPARATOR == '/' {
        PathBuf::from(path)
    } else {
        PathBuf::from(path.replace('/', &MAIN_SEPARATOR.to_string()))
    }
}

/// Join two posix fragments. An empty or `.` base leaves `rel` untouched.
pub fn posix_join(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() || base == "." {
        rel.to_string()
    } else {
        format!("{}/{}", base, rel)
    }
}

/// Lexically resolve `.` and `..` components without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if popped {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `path` relative to `base`, both absolute.
pub fn relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    pathdiff::diff_paths(path, base)
}

/// Posix offset that takes you from `base` to `path`; empty when equal.
pub fn posix_offset(path: &Path, base: &Path) -> Option<String> {
    relative_to(path, base).map(|p| to_posix(&p))
}

/// Return `path` in the case used on disk.
///
/// Only case-sensitive filesystems are handled, where this is a lexical
/// clean-up.
pub fn native_path_case(path: &Path) -> PathBuf {
    normalize(path)
}

/// Deepest directory that contains both `a` and `b`.
pub fn common_ancestor(a: &Path, b: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for (x, y) in a.components().zip(b.components()) {
        if x != y {
            break;
        }
        out.push(x.as_os_str());
    }
    out
}

/// `foo/bar.isolated` -> `bar`.
pub fn file_stem_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
