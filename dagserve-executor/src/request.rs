//! Request and response objects bound to one pipeline execution.

use dagserve_core::tensor::{Tensor, TensorMap};

/// Named input tensors for one pipeline execution.
///
/// Names must match the input aliases declared by the definition's entry
/// node; a missing name fails the execution with `REQUEST_MISSING_INPUT`.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The named inputs.
    pub inputs: TensorMap,
}

impl Request {
    /// Create an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input tensor.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }

    /// Look up an input by name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name)
    }
}

/// Named output tensors of one successful pipeline execution.
///
/// Only produced on success; a failed pipeline returns its status instead,
/// so callers never observe a partially populated response.
#[derive(Debug, Default)]
pub struct Response {
    /// The named outputs.
    pub outputs: TensorMap,
}

impl Response {
    /// Look up an output by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }
}
