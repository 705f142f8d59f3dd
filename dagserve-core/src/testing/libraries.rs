//! In-process custom-node libraries used across the test suites.
//!
//! Semantics follow the reference custom nodes of the original serving
//! stack: `add_sub` shifts every element by `add_value - sub_value`;
//! `different_ops` expands an input into four rows (add, subtract,
//! multiply, divide by the matching factor) and is the usual demultiplexer;
//! `choose_maximum` picks one row by a selection criterion and is the usual
//! gather; `faulty` misbehaves on demand to exercise every output
//! validation branch.

use crate::library::abi::{AbiParam, AbiTensor, AbiTensorInfo, LibraryApi};
use crate::library::NodeLibrary;
use crate::precision::Precision;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

// =============================================================================
// Allocation table
// =============================================================================

/// Every live allocation handed out by a mock library, keyed by address.
///
/// `release` removes the entry; releasing an unknown or already-freed
/// pointer returns a non-zero status instead of corrupting the heap, which
/// the engine surfaces as a warning.
static LIVE: LazyLock<Mutex<HashMap<usize, Layout>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Number of live mock allocations across all mock libraries.
///
/// Only meaningful when a single test drives the mock stack; parallel tests
/// share the table.
pub fn live_mock_allocations() -> usize {
    LIVE.lock().len()
}

fn alloc_array<T: Copy>(items: &[T]) -> *mut T {
    let layout = Layout::array::<T>(items.len().max(1)).expect("layout fits");
    // SAFETY: layout has non-zero size thanks to the max(1) above.
    let ptr = unsafe { std::alloc::alloc(layout) };
    assert!(!ptr.is_null(), "mock allocation failed");
    // SAFETY: freshly allocated region of at least items.len() elements.
    unsafe { std::ptr::copy_nonoverlapping(items.as_ptr(), ptr as *mut T, items.len()) };
    LIVE.lock().insert(ptr as usize, layout);
    ptr as *mut T
}

fn free(ptr: *mut c_void) -> bool {
    match LIVE.lock().remove(&(ptr as usize)) {
        Some(layout) => {
            // SAFETY: ptr came out of alloc_array with exactly this layout.
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn mock_release(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 1;
    }
    if free(ptr) {
        0
    } else {
        2
    }
}

// =============================================================================
// ABI helpers shared by the mock implementations
// =============================================================================

unsafe fn param_map(params: *const AbiParam, count: c_int) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if params.is_null() || count <= 0 {
        return map;
    }
    for param in std::slice::from_raw_parts(params, count as usize) {
        if param.key.is_null() || param.value.is_null() {
            continue;
        }
        map.insert(
            CStr::from_ptr(param.key).to_string_lossy().into_owned(),
            CStr::from_ptr(param.value).to_string_lossy().into_owned(),
        );
    }
    map
}

unsafe fn find_input<'a>(
    inputs: *const AbiTensor,
    count: c_int,
    name: &str,
) -> Option<&'a AbiTensor> {
    if inputs.is_null() || count <= 0 {
        return None;
    }
    std::slice::from_raw_parts(inputs, count as usize)
        .iter()
        .find(|tensor| {
            !tensor.name.is_null() && CStr::from_ptr(tensor.name).to_string_lossy() == name
        })
}

unsafe fn read_f32(tensor: &AbiTensor) -> Option<Vec<f32>> {
    if tensor.precision != Precision::Fp32 as c_int || tensor.data.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(tensor.data, tensor.data_bytes as usize);
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

unsafe fn read_dims(tensor: &AbiTensor) -> Vec<u64> {
    if tensor.dims.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(tensor.dims, tensor.dims_count as usize).to_vec()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_ne_bytes());
    }
    bytes
}

/// Allocate one FP32 output tensor with a static name.
fn make_output(name: &'static [u8], values: &[f32], dims: &[u64]) -> AbiTensor {
    let bytes = f32_bytes(values);
    AbiTensor {
        name: name.as_ptr() as *const c_char,
        data: alloc_array(&bytes),
        data_bytes: bytes.len() as u64,
        dims: alloc_array(dims),
        dims_count: dims.len() as u64,
        precision: Precision::Fp32 as c_int,
    }
}

unsafe fn emit(outputs: *mut *mut AbiTensor, count: *mut c_int, tensors: &[AbiTensor]) {
    *outputs = alloc_array(tensors);
    *count = tensors.len() as c_int;
}

fn make_info(name: &'static [u8], dims: &[u64]) -> AbiTensorInfo {
    AbiTensorInfo {
        name: name.as_ptr() as *const c_char,
        dims: alloc_array(dims),
        dims_count: dims.len() as u64,
        precision: Precision::Fp32 as c_int,
    }
}

unsafe fn emit_info(info: *mut *mut AbiTensorInfo, count: *mut c_int, entries: &[AbiTensorInfo]) {
    *info = alloc_array(entries);
    *count = entries.len() as c_int;
}

// =============================================================================
// add_sub
// =============================================================================

unsafe extern "C" fn add_sub_execute(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int {
    let params = param_map(params, params_count);
    let add: f32 = params.get("add_value").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let sub: f32 = params.get("sub_value").and_then(|v| v.parse().ok()).unwrap_or(0.0);

    let Some(input) = find_input(inputs, inputs_count, "input_numbers") else {
        return 1;
    };
    let Some(values) = read_f32(input) else {
        return 2;
    };
    let shifted: Vec<f32> = values.iter().map(|v| v + add - sub).collect();
    let dims = read_dims(input);

    emit(
        outputs,
        outputs_count,
        &[make_output(b"output_numbers\0", &shifted, &dims)],
    );
    0
}

unsafe extern "C" fn add_sub_inputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"input_numbers\0", &[0, 0])]);
    0
}

unsafe extern "C" fn add_sub_outputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"output_numbers\0", &[0, 0])]);
    0
}

/// The `add_sub` library: `output = input + add_value - sub_value`.
pub fn add_sub_library() -> NodeLibrary {
    NodeLibrary::from_api(
        "add_sub",
        LibraryApi {
            execute: add_sub_execute,
            get_inputs_info: add_sub_inputs_info,
            get_outputs_info: add_sub_outputs_info,
            release: mock_release,
        },
    )
}

// =============================================================================
// different_ops
// =============================================================================

unsafe extern "C" fn different_ops_execute(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    let Some(input) = find_input(inputs, inputs_count, "input_numbers") else {
        return 1;
    };
    let Some(factors_tensor) = find_input(inputs, inputs_count, "op_factors") else {
        return 1;
    };
    let Some(values) = read_f32(input) else {
        return 2;
    };
    let Some(factors) = read_f32(factors_tensor) else {
        return 2;
    };
    if factors.len() != 4 {
        return 3;
    }

    // Row per operation: add, subtract, multiply, divide by the factor.
    let mut rows = Vec::with_capacity(values.len() * 4);
    for (op, factor) in factors.iter().enumerate() {
        rows.extend(values.iter().map(|v| match op {
            0 => v + factor,
            1 => v - factor,
            2 => v * factor,
            _ => v / factor,
        }));
    }

    let mut dims = Vec::with_capacity(read_dims(input).len() + 1);
    dims.push(4u64);
    dims.extend(read_dims(input));

    emit(
        outputs,
        outputs_count,
        &[make_output(b"different_ops_results\0", &rows, &dims)],
    );
    0
}

unsafe extern "C" fn different_ops_inputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(
        info,
        count,
        &[
            make_info(b"input_numbers\0", &[0, 0]),
            make_info(b"op_factors\0", &[1, 4]),
        ],
    );
    0
}

unsafe extern "C" fn different_ops_outputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"different_ops_results\0", &[4, 0, 0])]);
    0
}

/// The `different_ops` library: expands the input into four rows, one per
/// arithmetic operation against `op_factors`.
pub fn different_ops_library() -> NodeLibrary {
    NodeLibrary::from_api(
        "different_ops",
        LibraryApi {
            execute: different_ops_execute,
            get_inputs_info: different_ops_inputs_info,
            get_outputs_info: different_ops_outputs_info,
            release: mock_release,
        },
    )
}

// =============================================================================
// choose_maximum
// =============================================================================

unsafe extern "C" fn choose_maximum_execute(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int {
    let params = param_map(params, params_count);
    let criteria = params
        .get("selection_criteria")
        .map(String::as_str)
        .unwrap_or("MAXIMUM_MAXIMUM");

    let Some(input) = find_input(inputs, inputs_count, "input_tensors") else {
        return 1;
    };
    let Some(values) = read_f32(input) else {
        return 2;
    };
    let dims = read_dims(input);
    if dims.len() < 2 || dims[0] == 0 {
        return 3;
    }
    let rows = dims[0] as usize;
    let row_len = values.len() / rows;

    let metric = |row: &[f32]| -> f32 {
        match criteria {
            "MAXIMUM_MINIMUM" => row.iter().copied().fold(f32::INFINITY, f32::min),
            "MAXIMUM_AVERAGE" => row.iter().sum::<f32>() / row.len() as f32,
            _ => row.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    };

    let best = (0..rows)
        .max_by(|&a, &b| {
            let ma = metric(&values[a * row_len..(a + 1) * row_len]);
            let mb = metric(&values[b * row_len..(b + 1) * row_len]);
            ma.partial_cmp(&mb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);

    emit(
        outputs,
        outputs_count,
        &[make_output(
            b"maximum_tensor\0",
            &values[best * row_len..(best + 1) * row_len],
            &dims[1..],
        )],
    );
    0
}

unsafe extern "C" fn choose_maximum_inputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"input_tensors\0", &[0, 0, 0])]);
    0
}

unsafe extern "C" fn choose_maximum_outputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"maximum_tensor\0", &[0, 0])]);
    0
}

/// The `choose_maximum` library: selects one leading-axis row by
/// `selection_criteria` (MAXIMUM_MAXIMUM, MAXIMUM_MINIMUM or
/// MAXIMUM_AVERAGE).
pub fn choose_maximum_library() -> NodeLibrary {
    NodeLibrary::from_api(
        "choose_maximum",
        LibraryApi {
            execute: choose_maximum_execute,
            get_inputs_info: choose_maximum_inputs_info,
            get_outputs_info: choose_maximum_outputs_info,
            release: mock_release,
        },
    )
}

// =============================================================================
// faulty
// =============================================================================

unsafe extern "C" fn faulty_execute(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int {
    let params = param_map(params, params_count);
    let mode = params.get("mode").map(String::as_str).unwrap_or("passthrough");

    let Some(input) = find_input(inputs, inputs_count, "input_numbers") else {
        return 1;
    };
    let Some(values) = read_f32(input) else {
        return 2;
    };
    let dims = read_dims(input);

    match mode {
        // A failing execute must leave no allocation behind.
        "fail_execute" => 3,
        "sleep" => {
            let ms: u64 = params
                .get("sleep_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100);
            std::thread::sleep(std::time::Duration::from_millis(ms));
            emit(
                outputs,
                outputs_count,
                &[make_output(b"output_numbers\0", &values, &dims)],
            );
            0
        }
        "null_outputs" => {
            *outputs = std::ptr::null_mut();
            *outputs_count = 1;
            0
        }
        "wrong_count" => {
            emit(
                outputs,
                outputs_count,
                &[
                    make_output(b"output_numbers\0", &values, &dims),
                    make_output(b"surplus\0", &values, &dims),
                ],
            );
            0
        }
        "missing_output" => {
            emit(
                outputs,
                outputs_count,
                &[make_output(b"unexpected_name\0", &values, &dims)],
            );
            0
        }
        "bad_precision" => {
            let mut tensor = make_output(b"output_numbers\0", &values, &dims);
            tensor.precision = 99;
            emit(outputs, outputs_count, &[tensor]);
            0
        }
        "zero_dim" => {
            let zeroed: Vec<u64> = dims.iter().enumerate().map(|(i, &d)| if i == dims.len() - 1 { 0 } else { d }).collect();
            let mut tensor = make_output(b"output_numbers\0", &values, &zeroed);
            tensor.data_bytes = values.len() as u64 * 4;
            emit(outputs, outputs_count, &[tensor]);
            0
        }
        "empty_shape" => {
            emit(
                outputs,
                outputs_count,
                &[make_output(b"output_numbers\0", &values, &[])],
            );
            0
        }
        "wrong_content_size" => {
            let mut tensor = make_output(b"output_numbers\0", &values, &dims);
            tensor.data_bytes = tensor.data_bytes.saturating_sub(4);
            emit(outputs, outputs_count, &[tensor]);
            0
        }
        _ => {
            emit(
                outputs,
                outputs_count,
                &[make_output(b"output_numbers\0", &values, &dims)],
            );
            0
        }
    }
}

unsafe extern "C" fn faulty_inputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"input_numbers\0", &[0, 0])]);
    0
}

unsafe extern "C" fn faulty_outputs_info(
    info: *mut *mut AbiTensorInfo,
    count: *mut c_int,
    _params: *const AbiParam,
    _params_count: c_int,
) -> c_int {
    emit_info(info, count, &[make_info(b"output_numbers\0", &[0, 0])]);
    0
}

/// The `faulty` library: misbehaves according to its `mode` parameter, to
/// exercise every output-validation branch of the engine.
pub fn faulty_library() -> NodeLibrary {
    NodeLibrary::from_api(
        "faulty",
        LibraryApi {
            execute: faulty_execute,
            get_inputs_info: faulty_inputs_info,
            get_outputs_info: faulty_outputs_info,
            release: mock_release,
        },
    )
}

// =============================================================================
// counting
// =============================================================================

static COUNTING_ALLOCS: AtomicU64 = AtomicU64::new(0);
static COUNTING_FREES: AtomicU64 = AtomicU64::new(0);

fn counting_alloc_array<T: Copy>(items: &[T]) -> *mut T {
    COUNTING_ALLOCS.fetch_add(1, Ordering::AcqRel);
    alloc_array(items)
}

unsafe extern "C" fn counting_release(ptr: *mut c_void) -> c_int {
    COUNTING_FREES.fetch_add(1, Ordering::AcqRel);
    mock_release(ptr)
}

unsafe extern "C" fn counting_execute(
    inputs: *const AbiTensor,
    inputs_count: c_int,
    outputs: *mut *mut AbiTensor,
    outputs_count: *mut c_int,
    params: *const AbiParam,
    params_count: c_int,
) -> c_int {
    let params = param_map(params, params_count);
    let add: f32 = params.get("add_value").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let sub: f32 = params.get("sub_value").and_then(|v| v.parse().ok()).unwrap_or(0.0);

    let Some(input) = find_input(inputs, inputs_count, "input_numbers") else {
        return 1;
    };
    let Some(values) = read_f32(input) else {
        return 2;
    };
    let shifted: Vec<f32> = values.iter().map(|v| v + add - sub).collect();
    let bytes = f32_bytes(&shifted);
    let dims = read_dims(input);

    let tensor = AbiTensor {
        name: b"output_numbers\0".as_ptr() as *const c_char,
        data: counting_alloc_array(&bytes),
        data_bytes: bytes.len() as u64,
        dims: counting_alloc_array(&dims),
        dims_count: dims.len() as u64,
        precision: Precision::Fp32 as c_int,
    };
    *outputs = counting_alloc_array(&[tensor]);
    *outputs_count = 1;
    0
}

/// The `counting` library: add_sub semantics with dedicated allocation and
/// release counters, so one test can assert the engine's exactly-once
/// release discipline without sharing state with other mock libraries.
pub fn counting_library() -> NodeLibrary {
    NodeLibrary::from_api(
        "counting",
        LibraryApi {
            execute: counting_execute,
            get_inputs_info: add_sub_inputs_info,
            get_outputs_info: add_sub_outputs_info,
            release: counting_release,
        },
    )
}

/// `(allocations, frees)` observed by the counting library.
pub fn counting_library_counters() -> (u64, u64) {
    (
        COUNTING_ALLOCS.load(Ordering::Acquire),
        COUNTING_FREES.load(Ordering::Acquire),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use std::sync::Arc;

    fn run(
        library: NodeLibrary,
        inputs: &[(&str, Tensor)],
        params: &[(&str, &str)],
    ) -> crate::error::Result<Vec<crate::library::LibraryOutput>> {
        let library = Arc::new(library);
        let inputs: Vec<(String, Tensor)> = inputs
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        library.execute("test_node", &inputs, &params)
    }

    fn output_f32(output: &crate::library::LibraryOutput) -> Vec<f32> {
        output
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn add_sub_shifts_elements() {
        let input = Tensor::from_f32(vec![1, 3], &[3.2, 5.7, -2.4]).unwrap();
        let outputs = run(
            add_sub_library(),
            &[("input_numbers", input)],
            &[("add_value", "2.5"), ("sub_value", "4.8")],
        )
        .unwrap();
        let values = output_f32(&outputs[0]);
        for (value, expected) in values.iter().zip([0.9f32, 3.4, -4.7]) {
            assert!((value - expected).abs() < 0.001, "{value} vs {expected}");
        }
    }

    #[test]
    fn different_ops_builds_four_rows() {
        let input = Tensor::from_f32(vec![1, 2], &[8.0, 12.0]).unwrap();
        let factors = Tensor::from_f32(vec![1, 4], &[1.0, 3.0, 2.0, 2.0]).unwrap();
        let outputs = run(
            different_ops_library(),
            &[("input_numbers", input), ("op_factors", factors)],
            &[],
        )
        .unwrap();
        assert_eq!(outputs[0].shape, vec![4, 1, 2]);
        assert_eq!(
            output_f32(&outputs[0]),
            vec![9.0, 13.0, 5.0, 9.0, 16.0, 24.0, 4.0, 6.0]
        );
    }

    #[test]
    fn choose_maximum_picks_row_by_minimum() {
        // Rows: min 1.0, min 5.0, min 3.0 -> row 1 wins.
        let input = Tensor::from_f32(
            vec![3, 2],
            &[1.0, 10.0, 5.0, 6.0, 3.0, 9.0],
        )
        .unwrap();
        let outputs = run(
            choose_maximum_library(),
            &[("input_tensors", input)],
            &[("selection_criteria", "MAXIMUM_MINIMUM")],
        )
        .unwrap();
        assert_eq!(outputs[0].shape, vec![2]);
        assert_eq!(output_f32(&outputs[0]), vec![5.0, 6.0]);
    }

    #[test]
    fn choose_maximum_picks_row_by_maximum() {
        let input = Tensor::from_f32(
            vec![3, 2],
            &[1.0, 10.0, 5.0, 6.0, 3.0, 9.0],
        )
        .unwrap();
        let outputs = run(
            choose_maximum_library(),
            &[("input_tensors", input)],
            &[("selection_criteria", "MAXIMUM_MAXIMUM")],
        )
        .unwrap();
        assert_eq!(output_f32(&outputs[0]), vec![1.0, 10.0]);
    }

    #[test]
    fn faulty_modes_return_distinct_defects() {
        let input = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();

        let err = run(
            faulty_library(),
            &[("input_numbers", input.clone())],
            &[("mode", "fail_execute")],
        )
        .unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_EXECUTION_FAILED");

        let outputs = run(
            faulty_library(),
            &[("input_numbers", input.clone())],
            &[("mode", "bad_precision")],
        )
        .unwrap();
        assert_eq!(outputs[0].precision, 99);

        let outputs = run(
            faulty_library(),
            &[("input_numbers", input)],
            &[("mode", "wrong_content_size")],
        )
        .unwrap();
        assert_eq!(outputs[0].data.len(), 4);
    }

    #[test]
    fn counting_library_balances_after_drop() {
        let input = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();
        let (allocs_before, _) = counting_library_counters();
        let outputs = run(
            counting_library(),
            &[("input_numbers", input)],
            &[("add_value", "1.0")],
        )
        .unwrap();
        drop(outputs);
        let (allocs, frees) = counting_library_counters();
        assert_eq!(allocs - allocs_before, 3);
        assert_eq!(allocs, frees);
    }
}
