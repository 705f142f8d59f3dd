//! Custom-node libraries: the opaque four-function capability handle,
//! buffer-ownership accounting and the process-wide registry.

pub mod abi;
pub mod loader;

use crate::error::{PipelineError, Result};
use crate::tensor::Tensor;
use abi::{AbiParam, AbiTensor, AbiTensorInfo, LibraryApi, TensorsInfoFn, ABI_STATUS_OK};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A loaded custom-node library.
///
/// Shared by reference between the [`LibraryRegistry`] and every node and
/// adopted buffer that uses it; the shared object stays mapped until the
/// last `Arc` drops.
pub struct NodeLibrary {
    name: String,
    path: Option<PathBuf>,
    api: LibraryApi,
    /// Number of adopted data buffers not yet returned through `release`.
    outstanding: AtomicI64,
    /// Keeps the shared object mapped for as long as the api pointers live.
    _handle: Option<libloading::Library>,
}

impl std::fmt::Debug for NodeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("outstanding", &self.outstanding.load(Ordering::Acquire))
            .finish()
    }
}

/// One output handed back by a library's `execute`, with its data buffer
/// already adopted into release-on-drop ownership.
///
/// The precision is kept as the raw ABI tag so the caller can report
/// `NODE_LIBRARY_INVALID_PRECISION` for unrecognized values.
#[derive(Debug, Clone)]
pub struct LibraryOutput {
    /// Producer-local output name.
    pub name: String,
    /// Raw ABI precision tag.
    pub precision: c_int,
    /// Dimension vector as reported.
    pub shape: Vec<u64>,
    /// The library-owned buffer; released through the library when the last
    /// handle drops.
    pub data: Bytes,
}

/// Tensor metadata declared by `getInputsInfo` / `getOutputsInfo`.
#[derive(Debug, Clone)]
pub struct LibraryTensorInfo {
    /// Declared tensor name.
    pub name: String,
    /// Declared dimensions; zero entries mean "any extent".
    pub shape: Vec<u64>,
    /// Declared precision, `None` for an unrecognized tag.
    pub precision: Option<crate::precision::Precision>,
}

impl NodeLibrary {
    pub(crate) fn from_loaded(
        name: String,
        path: PathBuf,
        api: LibraryApi,
        handle: libloading::Library,
    ) -> Self {
        Self {
            name,
            path: Some(path),
            api,
            outstanding: AtomicI64::new(0),
            _handle: Some(handle),
        }
    }

    /// Wrap an in-process implementation of the ABI.
    ///
    /// Used for builtin operators and test libraries that are compiled into
    /// the binary instead of living in a shared object. Ownership rules are
    /// identical: everything the api hands out goes back through `release`.
    pub fn from_api(name: impl Into<String>, api: LibraryApi) -> Self {
        Self {
            name: name.into(),
            path: None,
            api,
            outstanding: AtomicI64::new(0),
            _handle: None,
        }
    }

    /// The registry name of this library.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the shared object, if the library was dynamically loaded.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Number of adopted data buffers not yet released.
    ///
    /// Zero after a request completes means the engine honored the
    /// exactly-once release contract for this library.
    #[must_use]
    pub fn outstanding_allocations(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Run the library's `execute` with the given named inputs and
    /// parameters, adopting every produced buffer.
    ///
    /// On success every output's data buffer is owned by the returned
    /// [`LibraryOutput`]s; dims arrays and the output array base have
    /// already been released. On any failure past the `execute` call itself,
    /// buffers adopted so far are released by drop, so no allocation leaks
    /// on validation paths. A failing `execute` leaves no allocation the
    /// engine is responsible for, per the ABI contract.
    pub fn execute(
        self: &Arc<Self>,
        node: &str,
        inputs: &[(String, Tensor)],
        params: &[(String, String)],
    ) -> Result<Vec<LibraryOutput>> {
        let names: Vec<CString> = inputs
            .iter()
            .map(|(name, _)| c_string(name))
            .collect::<Result<_>>()?;
        let dims: Vec<Vec<u64>> = inputs
            .iter()
            .map(|(_, tensor)| tensor.shape().to_vec())
            .collect();
        let views: Vec<AbiTensor> = inputs
            .iter()
            .zip(names.iter().zip(dims.iter()))
            .map(|((_, tensor), (name, shape))| AbiTensor {
                name: name.as_ptr(),
                data: tensor.data().as_ptr() as *mut u8,
                data_bytes: tensor.byte_len() as u64,
                dims: shape.as_ptr() as *mut u64,
                dims_count: shape.len() as u64,
                precision: tensor.precision() as c_int,
            })
            .collect();
        let params = ParamStorage::new(params)?;

        let mut out_ptr: *mut AbiTensor = std::ptr::null_mut();
        let mut out_count: c_int = 0;
        // SAFETY: the view array and params outlive the call; the library
        // contract forbids it from retaining pointers past the return.
        let status = unsafe {
            (self.api.execute)(
                views.as_ptr(),
                views.len() as c_int,
                &mut out_ptr,
                &mut out_count,
                params.as_ptr(),
                params.len() as c_int,
            )
        };
        if status != ABI_STATUS_OK {
            return Err(PipelineError::LibraryExecutionFailed {
                node: node.to_string(),
                status,
            });
        }
        if out_count < 0 || (out_ptr.is_null() && out_count > 0) {
            return Err(PipelineError::LibraryOutputsCorrupted {
                node: node.to_string(),
            });
        }
        if out_ptr.is_null() {
            return Ok(Vec::new());
        }

        // SAFETY: the library reported out_count entries at out_ptr.
        let entries: Vec<AbiTensor> =
            unsafe { std::slice::from_raw_parts(out_ptr, out_count as usize) }.to_vec();
        self.call_release(out_ptr as *mut c_void);

        // Adopt every buffer before validating anything: if an entry turns
        // out corrupted, the outputs adopted so far release on drop.
        let mut corrupted = false;
        let mut outputs = Vec::with_capacity(entries.len());
        for entry in entries {
            let data = if entry.data.is_null() {
                corrupted = true;
                None
            } else {
                Some(self.adopt(entry.data, entry.data_bytes as usize))
            };
            let shape = if entry.dims.is_null() {
                Vec::new()
            } else {
                // SAFETY: dims_count entries at dims, owned by the library.
                let shape =
                    unsafe { std::slice::from_raw_parts(entry.dims, entry.dims_count as usize) }
                        .to_vec();
                self.call_release(entry.dims as *mut c_void);
                shape
            };
            let name = if entry.name.is_null() {
                corrupted = true;
                None
            } else {
                // SAFETY: name is a NUL-terminated string owned by the entry.
                Some(unsafe { CStr::from_ptr(entry.name) }.to_string_lossy().into_owned())
            };
            if let (Some(name), Some(data)) = (name, data) {
                outputs.push(LibraryOutput {
                    name,
                    precision: entry.precision,
                    shape,
                    data,
                });
            }
        }
        if corrupted {
            return Err(PipelineError::LibraryOutputsCorrupted {
                node: node.to_string(),
            });
        }
        Ok(outputs)
    }

    /// Query the library's declared inputs for the given parameters.
    pub fn inputs_info(&self, params: &[(String, String)]) -> Result<Vec<LibraryTensorInfo>> {
        self.tensors_info(self.api.get_inputs_info, "getInputsInfo", params)
    }

    /// Query the library's declared outputs for the given parameters.
    pub fn outputs_info(&self, params: &[(String, String)]) -> Result<Vec<LibraryTensorInfo>> {
        self.tensors_info(self.api.get_outputs_info, "getOutputsInfo", params)
    }

    fn tensors_info(
        &self,
        entry_point: TensorsInfoFn,
        call: &str,
        params: &[(String, String)],
    ) -> Result<Vec<LibraryTensorInfo>> {
        let params = ParamStorage::new(params)?;
        let mut info_ptr: *mut AbiTensorInfo = std::ptr::null_mut();
        let mut count: c_int = 0;
        // SAFETY: params outlive the call.
        let status =
            unsafe { entry_point(&mut info_ptr, &mut count, params.as_ptr(), params.len() as c_int) };
        if status != ABI_STATUS_OK {
            return Err(PipelineError::Unknown {
                cause: format!("library '{}' {} returned status {}", self.name, call, status),
            });
        }
        if count < 0 || (info_ptr.is_null() && count > 0) {
            return Err(PipelineError::Unknown {
                cause: format!("library '{}' {} reported a corrupted info array", self.name, call),
            });
        }
        if info_ptr.is_null() {
            return Ok(Vec::new());
        }

        // SAFETY: count entries at info_ptr.
        let entries: Vec<AbiTensorInfo> =
            unsafe { std::slice::from_raw_parts(info_ptr, count as usize) }.to_vec();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let shape = if entry.dims.is_null() {
                Vec::new()
            } else {
                // SAFETY: dims_count entries at dims.
                let shape =
                    unsafe { std::slice::from_raw_parts(entry.dims, entry.dims_count as usize) }
                        .to_vec();
                self.call_release(entry.dims as *mut c_void);
                shape
            };
            let name = if entry.name.is_null() {
                String::new()
            } else {
                // SAFETY: NUL-terminated string owned by the entry.
                unsafe { CStr::from_ptr(entry.name) }.to_string_lossy().into_owned()
            };
            infos.push(LibraryTensorInfo {
                name,
                shape,
                precision: crate::precision::Precision::from_abi(entry.precision),
            });
        }
        self.call_release(info_ptr as *mut c_void);
        Ok(infos)
    }

    /// Wrap a library-owned buffer so it is released exactly once, when the
    /// last [`Bytes`] handle drops.
    fn adopt(self: &Arc<Self>, ptr: *mut u8, len: usize) -> Bytes {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Bytes::from_owner(LibraryBuffer {
            ptr,
            len,
            library: Arc::clone(self),
        })
    }

    fn call_release(&self, ptr: *mut c_void) {
        // SAFETY: ptr was produced by this library.
        let status = unsafe { (self.api.release)(ptr) };
        if status != ABI_STATUS_OK {
            tracing::warn!(
                library = %self.name,
                status,
                "custom node library release returned non-zero status"
            );
        }
    }
}

/// A data buffer owned by a custom-node library, returned to it on drop.
struct LibraryBuffer {
    ptr: *mut u8,
    len: usize,
    library: Arc<NodeLibrary>,
}

// SAFETY: the buffer is immutable after the library hands it over, and the
// library contract requires `release` to be callable from any thread.
unsafe impl Send for LibraryBuffer {}
unsafe impl Sync for LibraryBuffer {}

impl AsRef<[u8]> for LibraryBuffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live library allocation until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for LibraryBuffer {
    fn drop(&mut self) {
        self.library.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.library.call_release(self.ptr as *mut c_void);
    }
}

/// Owned backing storage for an [`AbiParam`] array.
struct ParamStorage {
    _keys: Vec<CString>,
    _values: Vec<CString>,
    views: Vec<AbiParam>,
}

impl ParamStorage {
    fn new(params: &[(String, String)]) -> Result<Self> {
        let keys: Vec<CString> = params.iter().map(|(k, _)| c_string(k)).collect::<Result<_>>()?;
        let values: Vec<CString> =
            params.iter().map(|(_, v)| c_string(v)).collect::<Result<_>>()?;
        let views = keys
            .iter()
            .zip(values.iter())
            .map(|(key, value)| AbiParam {
                key: key.as_ptr(),
                value: value.as_ptr(),
            })
            .collect();
        Ok(Self {
            _keys: keys,
            _values: values,
            views,
        })
    }

    fn as_ptr(&self) -> *const AbiParam {
        self.views.as_ptr()
    }

    fn len(&self) -> usize {
        self.views.len()
    }
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| PipelineError::Unknown {
        cause: format!("string '{}' contains an interior NUL byte", value),
    })
}

/// Process-wide registry of custom-node libraries, keyed by name.
#[derive(Debug, Default)]
pub struct LibraryRegistry {
    libraries: RwLock<HashMap<String, Arc<NodeLibrary>>>,
}

impl LibraryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a shared object and register it under `name`.
    pub fn load(
        &self,
        name: impl Into<String>,
        path: &std::path::Path,
        allowed_root: &std::path::Path,
    ) -> Result<Arc<NodeLibrary>> {
        let name = name.into();
        if self.libraries.read().contains_key(&name) {
            return Err(PipelineError::LibraryAlreadyExists { library: name });
        }
        let library = loader::load(name, path, allowed_root)?;
        self.register(library)
    }

    /// Register an already-constructed library.
    pub fn register(&self, library: NodeLibrary) -> Result<Arc<NodeLibrary>> {
        let mut libraries = self.libraries.write();
        if libraries.contains_key(library.name()) {
            return Err(PipelineError::LibraryAlreadyExists {
                library: library.name().to_string(),
            });
        }
        let library = Arc::new(library);
        libraries.insert(library.name().to_string(), Arc::clone(&library));
        Ok(library)
    }

    /// Resolve a library by name.
    pub fn get(&self, name: &str) -> Result<Arc<NodeLibrary>> {
        self.libraries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::LibraryNameMissing {
                library: name.to_string(),
            })
    }

    /// Check whether a library is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.libraries.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::Precision;
    use crate::testing;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn registry_rejects_duplicates() {
        let registry = LibraryRegistry::new();
        registry.register(testing::add_sub_library()).unwrap();
        let err = registry.register(testing::add_sub_library()).unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_ALREADY_EXISTS");
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = LibraryRegistry::new();
        registry.register(testing::add_sub_library()).unwrap();
        assert!(registry.get("add_sub").is_ok());
        let err = registry.get("missing").unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_NAME_MISSING");
    }

    #[test]
    fn execute_adopts_and_releases_outputs() {
        let library = Arc::new(testing::add_sub_library());
        let input = Tensor::from_f32(vec![1, 3], &[3.2, 5.7, -2.4]).unwrap();
        let outputs = library
            .execute(
                "adder",
                &[("input_numbers".to_string(), input)],
                &params(&[("add_value", "2.5"), ("sub_value", "4.8")]),
            )
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "output_numbers");
        assert_eq!(outputs[0].shape, vec![1, 3]);
        assert_eq!(outputs[0].precision, Precision::Fp32 as i32);
        assert_eq!(library.outstanding_allocations(), 1);

        drop(outputs);
        assert_eq!(library.outstanding_allocations(), 0);
    }

    #[test]
    fn failing_execute_maps_status() {
        let library = Arc::new(testing::faulty_library());
        let input = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();
        let err = library
            .execute(
                "broken",
                &[("input_numbers".to_string(), input)],
                &params(&[("mode", "fail_execute")]),
            )
            .unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_EXECUTION_FAILED");
        assert_eq!(library.outstanding_allocations(), 0);
    }

    #[test]
    fn corrupted_output_array_is_reported() {
        let library = Arc::new(testing::faulty_library());
        let input = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();
        let err = library
            .execute(
                "broken",
                &[("input_numbers".to_string(), input)],
                &params(&[("mode", "null_outputs")]),
            )
            .unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_OUTPUTS_CORRUPTED");
    }

    #[test]
    fn metadata_declares_outputs() {
        let library = Arc::new(testing::add_sub_library());
        let infos = library.outputs_info(&[]).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "output_numbers");
        assert_eq!(infos[0].precision, Some(Precision::Fp32));
    }
}
