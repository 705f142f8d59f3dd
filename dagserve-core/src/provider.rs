//! The seam to the underlying inference engine.

use crate::error::Result;
use crate::tensor::TensorMap;
use std::sync::Arc;

/// One servable model instance.
pub trait ModelInstance: Send + Sync {
    /// Run inference. Blocking; the scheduler calls this on the blocking
    /// pool.
    fn infer(&self, inputs: &TensorMap) -> Result<TensorMap>;
}

/// Receives model availability change notifications.
///
/// Pipeline definitions register one observer per referenced model so the
/// factory can revalidate them when a model is loaded, reloaded or retired.
pub trait ModelAvailabilityObserver: Send + Sync {
    /// Stable identifier used to unsubscribe (the pipeline name).
    fn observer_id(&self) -> &str;

    /// Called when the availability of `model` changes.
    fn model_changed(&self, model: &str);
}

/// Provides model instances and change subscriptions.
///
/// Implemented by the serving engine; the pipeline core only depends on
/// this trait.
pub trait ModelProvider: Send + Sync {
    /// Acquire an instance of `model`, optionally pinned to a version.
    ///
    /// Fails with `MODEL_MISSING` / `MODEL_VERSION_MISSING` when the
    /// reference does not resolve.
    fn get_instance(&self, model: &str, version: Option<u64>) -> Result<Arc<dyn ModelInstance>>;

    /// Register an observer for availability changes of `model`.
    fn subscribe(&self, model: &str, observer: Arc<dyn ModelAvailabilityObserver>);

    /// Remove the observer registered under `observer_id` for `model`.
    fn unsubscribe(&self, model: &str, observer_id: &str);
}
