//! DL node: runs a model through the model provider.

use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::{NodeInfo, OutputMapping};
use dagserve_core::provider::ModelProvider;
use dagserve_core::tensor::TensorMap;
use std::sync::Arc;

pub(crate) struct DlNode {
    name: String,
    model: String,
    version: Option<u64>,
    outputs: Vec<OutputMapping>,
    provider: Arc<dyn ModelProvider>,
}

impl DlNode {
    pub fn new(info: &NodeInfo, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            name: info.name.clone(),
            model: info
                .model_name
                .clone()
                .expect("validated dl node references a model"),
            version: info.model_version,
            outputs: info.outputs.clone(),
            provider,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a model instance, run inference on the blocking pool, and
    /// re-alias the results per the descriptor's output map.
    pub async fn execute(&self, inputs: TensorMap) -> Result<TensorMap> {
        let instance = self.provider.get_instance(&self.model, self.version)?;

        let results = tokio::task::spawn_blocking(move || instance.infer(&inputs))
            .await
            .map_err(|join_error| PipelineError::Unknown {
                cause: format!("inference task failed to join: {}", join_error),
            })??;

        let mut outputs = TensorMap::with_capacity(self.outputs.len());
        for mapping in &self.outputs {
            let tensor = results.get(&mapping.name).cloned().ok_or_else(|| {
                PipelineError::ModelMissingOutput {
                    model: self.model.clone(),
                    output: mapping.name.clone(),
                }
            })?;
            outputs.insert(mapping.alias.clone(), tensor);
        }
        Ok(outputs)
    }
}
