//! Exit node: collects tensors for the response.

use dagserve_core::graph::NodeInfo;
use dagserve_core::tensor::TensorMap;

pub(crate) struct ExitNode {
    name: String,
}

impl ExitNode {
    pub fn new(info: &NodeInfo) -> Self {
        Self {
            name: info.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy the received tensors into engine-owned buffers.
    ///
    /// The copy matters: inputs may still sit in library-owned memory, and
    /// every library allocation must be released before the response is
    /// handed to the caller.
    pub fn execute(&self, inputs: TensorMap) -> TensorMap {
        inputs
            .into_iter()
            .map(|(name, tensor)| (name, tensor.detached()))
            .collect()
    }
}
