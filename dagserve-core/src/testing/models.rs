//! Model-provider test doubles.

use crate::error::{PipelineError, Result};
use crate::provider::{ModelAvailabilityObserver, ModelInstance, ModelProvider};
use crate::tensor::{Tensor, TensorMap};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A model that adds a constant to every FP32 element.
///
/// The default instance mirrors the classic serving test model: input `b`,
/// output `a`, `a = b + 1`.
pub struct DummyModel {
    name: String,
    input: String,
    output: String,
    delta: f32,
}

impl DummyModel {
    /// The `b -> a = b + 1` model.
    #[must_use]
    pub fn increment() -> Self {
        Self::new("dummy", "b", "a", 1.0)
    }

    /// A model with custom input/output names and delta.
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        delta: f32,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            delta,
        }
    }
}

impl ModelInstance for DummyModel {
    fn infer(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let tensor = inputs
            .get(&self.input)
            .ok_or_else(|| PipelineError::InferenceFailed {
                model: self.name.clone(),
                cause: format!("request is missing input '{}'", self.input),
            })?;
        let values = tensor.as_f32()?;
        let shifted: Vec<f32> = values.iter().map(|v| v + self.delta).collect();
        let output = Tensor::from_f32(tensor.shape().to_vec(), &shifted)?;
        let mut outputs = TensorMap::new();
        outputs.insert(self.output.clone(), output);
        Ok(outputs)
    }
}

/// A model whose inference always fails.
pub struct FailingModel;

impl ModelInstance for FailingModel {
    fn infer(&self, _inputs: &TensorMap) -> Result<TensorMap> {
        Err(PipelineError::InferenceFailed {
            model: "failing".to_string(),
            cause: "synthetic failure".to_string(),
        })
    }
}

/// An in-memory model provider with explicit versions and change
/// notification.
#[derive(Default)]
pub struct StaticModelProvider {
    models: Mutex<HashMap<String, BTreeMap<u64, Arc<dyn ModelInstance>>>>,
    observers: Mutex<HashMap<String, Vec<Arc<dyn ModelAvailabilityObserver>>>>,
}

impl StaticModelProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` under version 1.
    pub fn add_model(&self, name: &str, model: impl ModelInstance + 'static) {
        self.add_model_version(name, 1, model);
    }

    /// Register a specific version of `model`.
    pub fn add_model_version(&self, name: &str, version: u64, model: impl ModelInstance + 'static) {
        self.models
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(version, Arc::new(model));
        self.notify(name);
    }

    /// Drop every version of `model` and notify its observers.
    pub fn remove_model(&self, name: &str) {
        self.models.lock().remove(name);
        self.notify(name);
    }

    fn notify(&self, model: &str) {
        let observers = self.observers.lock();
        if let Some(list) = observers.get(model) {
            for observer in list {
                observer.model_changed(model);
            }
        }
    }
}

impl ModelProvider for StaticModelProvider {
    fn get_instance(&self, model: &str, version: Option<u64>) -> Result<Arc<dyn ModelInstance>> {
        let models = self.models.lock();
        let versions = models.get(model).ok_or_else(|| PipelineError::ModelMissing {
            model: model.to_string(),
        })?;
        match version {
            Some(requested) => versions.get(&requested).cloned().ok_or_else(|| {
                PipelineError::ModelVersionMissing {
                    model: model.to_string(),
                    version: requested,
                }
            }),
            None => versions
                .values()
                .next_back()
                .cloned()
                .ok_or_else(|| PipelineError::ModelMissing {
                    model: model.to_string(),
                }),
        }
    }

    fn subscribe(&self, model: &str, observer: Arc<dyn ModelAvailabilityObserver>) {
        self.observers
            .lock()
            .entry(model.to_string())
            .or_default()
            .push(observer);
    }

    fn unsubscribe(&self, model: &str, observer_id: &str) {
        if let Some(list) = self.observers.lock().get_mut(model) {
            list.retain(|observer| observer.observer_id() != observer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dummy_model_increments() {
        let model = DummyModel::increment();
        let mut inputs = TensorMap::new();
        inputs.insert("b".to_string(), Tensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap());
        let outputs = model.infer(&inputs).unwrap();
        assert_eq!(outputs["a"].as_f32().unwrap(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn provider_resolves_versions() {
        let provider = StaticModelProvider::new();
        provider.add_model_version("dummy", 1, DummyModel::increment());
        provider.add_model_version("dummy", 3, DummyModel::new("dummy", "b", "a", 2.0));

        assert!(provider.get_instance("dummy", Some(3)).is_ok());
        assert!(provider.get_instance("dummy", None).is_ok());

        let err = provider.get_instance("dummy", Some(2)).err().unwrap();
        assert_eq!(err.code(), "MODEL_VERSION_MISSING");
        let err = provider.get_instance("absent", None).err().unwrap();
        assert_eq!(err.code(), "MODEL_MISSING");
    }

    #[test]
    fn observers_hear_changes() {
        struct CountingObserver {
            id: String,
            seen: AtomicUsize,
        }
        impl ModelAvailabilityObserver for CountingObserver {
            fn observer_id(&self) -> &str {
                &self.id
            }
            fn model_changed(&self, _model: &str) {
                self.seen.fetch_add(1, Ordering::AcqRel);
            }
        }

        let provider = StaticModelProvider::new();
        let observer = Arc::new(CountingObserver {
            id: "pipeline_a".to_string(),
            seen: AtomicUsize::new(0),
        });
        provider.subscribe("dummy", observer.clone());

        provider.add_model("dummy", DummyModel::increment());
        provider.remove_model("dummy");
        assert_eq!(observer.seen.load(Ordering::Acquire), 2);

        provider.unsubscribe("dummy", "pipeline_a");
        provider.add_model("dummy", DummyModel::increment());
        assert_eq!(observer.seen.load(Ordering::Acquire), 2);
    }
}
