//! Locating the libc objects to attach allocator probes to
//!
//! Probes attach to a file, not to a process, so every libc a traced child
//! might load needs its own attachment. Candidates are the usual multiarch
//! locations plus any glibc in the Nix store.

use anyhow::Result;
use log::debug;
use object::{Object, ObjectSymbol};
use std::path::{Path, PathBuf};

use crate::domain::TracerError;

const STANDARD_PATHS: &[&str] = &[
    "/lib/x86_64-linux-gnu/libc.so.6",
    "/usr/lib/x86_64-linux-gnu/libc.so.6",
    "/lib/aarch64-linux-gnu/libc.so.6",
    "/usr/lib/aarch64-linux-gnu/libc.so.6",
    "/lib64/libc.so.6",
    "/usr/lib64/libc.so.6",
];

const NIX_STORE: &str = "/nix/store";

/// All candidate paths, existing or not
#[must_use]
pub fn candidate_paths(nix_store: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = STANDARD_PATHS.iter().map(PathBuf::from).collect();

    if let Ok(entries) = std::fs::read_dir(nix_store) {
        let mut nix_paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.contains("glibc") && !name.contains("locales") && !name.contains("iconv")
            })
            .map(|entry| entry.path().join("lib").join("libc.so.6"))
            .collect();
        nix_paths.sort();
        paths.extend(nix_paths);
    }

    paths
}

/// Whether `path` is an ELF object exporting `malloc`
#[must_use]
pub fn exports_malloc(path: &Path) -> bool {
    let Ok(data) = std::fs::read(path) else {
        return false;
    };
    let Ok(obj) = object::File::parse(&*data) else {
        return false;
    };
    obj.dynamic_symbols().any(|sym| sym.is_definition() && sym.name().is_ok_and(|name| name == "malloc"))
}

/// Canonicalize, keep real libc objects, drop duplicates (symlinked paths
/// usually resolve to the same file)
#[must_use]
pub fn filter_candidates(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in paths {
        let Ok(canonical) = path.canonicalize() else {
            continue;
        };
        if !canonical.is_file() || kept.contains(&canonical) {
            continue;
        }
        if exports_malloc(&canonical) {
            debug!("libc candidate: {}", canonical.display());
            kept.push(canonical);
        } else {
            debug!("skipping {}: no exported malloc", canonical.display());
        }
    }
    kept
}

/// Every libc on this host the allocator probes should attach to
///
/// # Errors
/// Returns [`TracerError::LibcNotFound`] when no candidate qualifies
pub fn find_libc_paths() -> Result<Vec<PathBuf>> {
    let candidates = candidate_paths(Path::new(NIX_STORE));
    let searched = candidates.len();
    let found = filter_candidates(candidates);
    if found.is_empty() {
        return Err(TracerError::LibcNotFound { searched }.into());
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nix_store_glibc_dirs() {
        let store = tempfile::tempdir().unwrap();
        for name in ["abc-glibc-2.39", "def-glibc-locales-2.39", "ghi-glibc-iconv", "jkl-openssl"] {
            std::fs::create_dir(store.path().join(name)).unwrap();
        }

        let paths = candidate_paths(store.path());
        let nix: Vec<_> = paths.iter().filter(|p| p.starts_with(store.path())).collect();
        assert_eq!(nix, vec![&store.path().join("abc-glibc-2.39/lib/libc.so.6")]);
    }

    #[test]
    fn test_non_elf_and_missing_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("libc.so.6");
        std::fs::write(&fake, b"not an elf").unwrap();

        assert!(!exports_malloc(&fake));
        let kept = filter_candidates(vec![fake, dir.path().join("missing.so")]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        // needs a real libc; hosts without one in the standard locations skip
        let Some(libc) =
            candidate_paths(Path::new(NIX_STORE)).into_iter().find(|p| exports_malloc(p))
        else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("libc.so.6");
        std::os::unix::fs::symlink(&libc, &link).unwrap();

        let kept = filter_candidates(vec![libc.clone(), link, libc.clone()]);
        assert_eq!(kept, vec![libc.canonicalize().unwrap()]);
    }
}
