//! The stable C ABI spoken by custom-node libraries.
//!
//! A custom-node library is a shared object exporting exactly four symbols:
//! `execute`, `getInputsInfo`, `getOutputsInfo` and `release`. Every call
//! returns an `int` status where zero means success. All memory handed to
//! the engine by a library (output arrays, data buffers, dims arrays,
//! metadata arrays) is owned by the library and must be returned to it
//! through `release`, exactly once per allocation.

use std::os::raw::{c_char, c_int, c_void};

/// A tensor view crossing the ABI, in either direction.
///
/// For inputs the engine owns every pointed-to buffer and the library must
/// not retain or mutate them past the call. For outputs the library owns
/// the buffers and the engine returns each through `release`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiTensor {
    /// NUL-terminated tensor name.
    pub name: *const c_char,
    /// Contiguous element buffer.
    pub data: *mut u8,
    /// Length of `data` in bytes.
    pub data_bytes: u64,
    /// Dimension array.
    pub dims: *mut u64,
    /// Number of entries in `dims`.
    pub dims_count: u64,
    /// Element precision, one of the [`crate::precision::Precision`]
    /// discriminants.
    pub precision: c_int,
}

/// Tensor metadata returned by `getInputsInfo` / `getOutputsInfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiTensorInfo {
    /// NUL-terminated tensor name.
    pub name: *const c_char,
    /// Dimension array; entries of zero mean "any extent".
    pub dims: *mut u64,
    /// Number of entries in `dims`.
    pub dims_count: u64,
    /// Element precision tag.
    pub precision: c_int,
}

/// One `{key, value}` string parameter of a custom node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiParam {
    /// NUL-terminated parameter key.
    pub key: *const c_char,
    /// NUL-terminated parameter value.
    pub value: *const c_char,
}

/// `execute(inputs, inputs_count, outputs, outputs_count, params, params_count)`.
pub type ExecuteFn = unsafe extern "C" fn(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int;

/// `getInputsInfo` / `getOutputsInfo` share one shape.
pub type TensorsInfoFn = unsafe extern "C" fn(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int;

/// `release(ptr)` returns any library allocation.
pub type ReleaseFn = unsafe extern "C" fn(ptr: *mut c_void) -> c_int;

/// Status value meaning success for every ABI call.
pub const ABI_STATUS_OK: c_int = 0;

/// Symbol name of [`ExecuteFn`].
pub const SYMBOL_EXECUTE: &[u8] = b"execute\0";
/// Symbol name of the inputs-metadata call.
pub const SYMBOL_GET_INPUTS_INFO: &[u8] = b"getInputsInfo\0";
/// Symbol name of the outputs-metadata call.
pub const SYMBOL_GET_OUTPUTS_INFO: &[u8] = b"getOutputsInfo\0";
/// Symbol name of [`ReleaseFn`].
pub const SYMBOL_RELEASE: &[u8] = b"release\0";

/// The four resolved entry points of one library.
#[derive(Debug, Clone, Copy)]
pub struct LibraryApi {
    /// The `execute` entry point.
    pub execute: ExecuteFn,
    /// The `getInputsInfo` entry point.
    pub get_inputs_info: TensorsInfoFn,
    /// The `getOutputsInfo` entry point.
    pub get_outputs_info: TensorsInfoFn,
    /// The `release` entry point.
    pub release: ReleaseFn,
}
