//! Shared-object loading for custom-node libraries.

use super::abi::{
    ExecuteFn, LibraryApi, ReleaseFn, TensorsInfoFn, SYMBOL_EXECUTE, SYMBOL_GET_INPUTS_INFO,
    SYMBOL_GET_OUTPUTS_INFO, SYMBOL_RELEASE,
};
use super::NodeLibrary;
use crate::error::{PipelineError, Result};
use std::path::{Component, Path};

/// Load a custom-node library from a shared object.
///
/// The path must name a regular file under `allowed_root` and must not
/// contain a `..` component; violations fail with
/// `NODE_LIBRARY_INVALID_PATH`. All four ABI symbols must resolve, otherwise
/// loading fails with `NODE_LIBRARY_MISSING_SYMBOLS` naming the first
/// missing symbol.
pub fn load(name: impl Into<String>, path: &Path, allowed_root: &Path) -> Result<NodeLibrary> {
    let name = name.into();
    validate_path(path, allowed_root)?;

    // SAFETY: the library is trusted native code selected by the operator;
    // loading it runs its initializers, which is the entire point.
    let handle = unsafe { libloading::Library::new(path) }.map_err(|e| {
        PipelineError::LibraryLoadFailed {
            path: path.to_path_buf(),
            cause: e.to_string(),
        }
    })?;

    let api = resolve_api(&handle, path)?;

    tracing::info!(library = %name, path = %path.display(), "Loaded custom node library");
    Ok(NodeLibrary::from_loaded(name, path.to_path_buf(), api, handle))
}

fn resolve_api(handle: &libloading::Library, path: &Path) -> Result<LibraryApi> {
    let missing = |symbol: &[u8]| PipelineError::LibraryMissingSymbols {
        path: path.to_path_buf(),
        symbol: String::from_utf8_lossy(&symbol[..symbol.len() - 1]).into_owned(),
    };

    // SAFETY: the symbol types match the documented ABI signatures; a
    // library exporting these names with other signatures is undefined
    // behavior by contract, same as any C plugin interface.
    unsafe {
        let execute: ExecuteFn = *handle
            .get::<ExecuteFn>(SYMBOL_EXECUTE)
            .map_err(|_| missing(SYMBOL_EXECUTE))?;
        let get_inputs_info: TensorsInfoFn = *handle
            .get::<TensorsInfoFn>(SYMBOL_GET_INPUTS_INFO)
            .map_err(|_| missing(SYMBOL_GET_INPUTS_INFO))?;
        let get_outputs_info: TensorsInfoFn = *handle
            .get::<TensorsInfoFn>(SYMBOL_GET_OUTPUTS_INFO)
            .map_err(|_| missing(SYMBOL_GET_OUTPUTS_INFO))?;
        let release: ReleaseFn = *handle
            .get::<ReleaseFn>(SYMBOL_RELEASE)
            .map_err(|_| missing(SYMBOL_RELEASE))?;

        Ok(LibraryApi {
            execute,
            get_inputs_info,
            get_outputs_info,
            release,
        })
    }
}

/// Check that `path` is a regular file inside `allowed_root`.
pub fn validate_path(path: &Path, allowed_root: &Path) -> Result<()> {
    let reject = |cause: String| PipelineError::LibraryInvalidPath {
        path: path.to_path_buf(),
        cause,
    };

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(reject("path contains a parent-directory component".to_string()));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|e| reject(format!("cannot stat path: {}", e)))?;
    if !metadata.is_file() {
        return Err(reject("not a regular file".to_string()));
    }

    // Canonicalize both sides so symlinks cannot escape the root.
    let canonical = path
        .canonicalize()
        .map_err(|e| reject(format!("cannot resolve path: {}", e)))?;
    let root = allowed_root
        .canonicalize()
        .map_err(|e| reject(format!("cannot resolve allowed root: {}", e)))?;
    if !canonical.starts_with(&root) {
        return Err(reject(format!(
            "path resolves outside the allowed root {}",
            root.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_parent_dir_components() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("../escape.so");
        let err = validate_path(&path, dir.path()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_INVALID_PATH");
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_path(&dir.path().join("absent.so"), dir.path()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_INVALID_PATH");
    }

    #[test]
    fn rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let err = validate_path(&sub, dir.path()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_INVALID_PATH");
    }

    #[test]
    fn rejects_file_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let path = elsewhere.path().join("lib.so");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();
        let err = validate_path(&path, root.path()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_INVALID_PATH");
    }

    #[test]
    fn accepts_regular_file_under_root() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("lib.so");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();
        assert!(validate_path(&path, root.path()).is_ok());
    }

    #[test]
    fn load_fails_on_non_library_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("not_a_library.so");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"definitely not ELF")
            .unwrap();
        let err = load("bad", &path, root.path()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_LOAD_FAILED");
    }
}
