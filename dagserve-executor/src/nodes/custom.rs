//! Custom node: calls a custom-node library and validates what comes back.

use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::{NodeInfo, OutputMapping};
use dagserve_core::library::{LibraryOutput, NodeLibrary};
use dagserve_core::precision::Precision;
use dagserve_core::tensor::{Tensor, TensorMap};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct CustomNode {
    name: String,
    library: Arc<NodeLibrary>,
    parameters: Vec<(String, String)>,
    outputs: Vec<OutputMapping>,
    /// Aliases downstream edges actually consume.
    required_aliases: Vec<String>,
}

impl CustomNode {
    pub fn new(info: &NodeInfo, library: Arc<NodeLibrary>, required_aliases: Vec<String>) -> Self {
        Self {
            name: info.name.clone(),
            library,
            parameters: info.parameter_pairs(),
            outputs: info.outputs.clone(),
            required_aliases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the library's `execute` on the blocking pool and validate its
    /// outputs.
    ///
    /// Inputs are presented in lexical alias order so a library sees a
    /// stable layout regardless of arrival order.
    pub async fn execute(&self, inputs: TensorMap) -> Result<TensorMap> {
        let mut ordered: Vec<(String, Tensor)> = inputs.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let library = Arc::clone(&self.library);
        let name = self.name.clone();
        let parameters = self.parameters.clone();
        let (produced, declared_count) = tokio::task::spawn_blocking(move || {
            let declared = library.outputs_info(&parameters)?.len();
            let produced = library.execute(&name, &ordered, &parameters)?;
            Ok::<_, PipelineError>((produced, declared))
        })
        .await
        .map_err(|join_error| PipelineError::Unknown {
            cause: format!("custom node task failed to join: {}", join_error),
        })??;

        self.validate_outputs(produced, declared_count)
    }

    /// The output validation ladder, in its fixed order: produced count
    /// against the declared count, required aliases present, then per
    /// output the precision, shape and byte-length checks.
    fn validate_outputs(
        &self,
        produced: Vec<LibraryOutput>,
        declared_count: usize,
    ) -> Result<TensorMap> {
        if produced.len() != declared_count {
            return Err(PipelineError::LibraryOutputsCorruptedCount {
                node: self.name.clone(),
                declared: declared_count,
                produced: produced.len(),
            });
        }

        let by_name: HashMap<&str, &LibraryOutput> = produced
            .iter()
            .map(|output| (output.name.as_str(), output))
            .collect();
        for alias in &self.required_aliases {
            let present = self
                .local_name(alias)
                .is_some_and(|local| by_name.contains_key(local));
            if !present {
                return Err(PipelineError::LibraryMissingOutput {
                    node: self.name.clone(),
                    output: alias.clone(),
                });
            }
        }

        for output in &produced {
            let precision = match Precision::from_abi(output.precision) {
                Some(Precision::Unspecified) | None => {
                    return Err(PipelineError::LibraryInvalidPrecision {
                        node: self.name.clone(),
                        output: output.name.clone(),
                    });
                }
                Some(precision) => precision,
            };
            if output.shape.is_empty() || output.shape.iter().any(|&dim| dim == 0) {
                return Err(PipelineError::LibraryInvalidShape {
                    node: self.name.clone(),
                    output: output.name.clone(),
                });
            }
            let elements: u64 = output.shape.iter().product();
            let expected = elements as usize * precision.size().expect("concrete precision");
            if output.data.len() != expected {
                return Err(PipelineError::LibraryInvalidContentSize {
                    node: self.name.clone(),
                    output: output.name.clone(),
                    expected,
                    actual: output.data.len(),
                });
            }
        }

        let mut outputs = TensorMap::new();
        for mapping in &self.outputs {
            if let Some(output) = by_name.get(mapping.name.as_str()) {
                let precision =
                    Precision::from_abi(output.precision).expect("validated above");
                let tensor =
                    Tensor::new(precision, output.shape.clone(), output.data.clone())?;
                outputs.insert(mapping.alias.clone(), tensor);
            }
        }
        Ok(outputs)
    }

    fn local_name(&self, alias: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|mapping| mapping.alias == alias)
            .map(|mapping| mapping.name.as_str())
    }
}
