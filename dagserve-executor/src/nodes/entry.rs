//! Entry node: materializes the bound request into the graph.

use crate::request::Request;
use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::{NodeInfo, OutputMapping};
use dagserve_core::tensor::TensorMap;
use std::sync::Arc;

pub(crate) struct EntryNode {
    name: String,
    outputs: Vec<OutputMapping>,
    request: Arc<Request>,
}

impl EntryNode {
    pub fn new(info: &NodeInfo, request: Arc<Request>) -> Self {
        Self {
            name: info.name.clone(),
            outputs: info.outputs.clone(),
            request,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit every declared pipeline input under its alias.
    ///
    /// Tensors are cheap handle clones of the caller's buffers; nothing is
    /// copied here.
    pub fn execute(&self) -> Result<TensorMap> {
        let mut outputs = TensorMap::with_capacity(self.outputs.len());
        for mapping in &self.outputs {
            let tensor = self.request.input(&mapping.name).ok_or_else(|| {
                PipelineError::RequestMissingInput {
                    input: mapping.name.clone(),
                }
            })?;
            outputs.insert(mapping.alias.clone(), tensor.clone());
        }
        Ok(outputs)
    }
}
