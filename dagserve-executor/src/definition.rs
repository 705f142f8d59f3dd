//! Pipeline definitions: validated blueprints with a lifecycle.

use crate::config::ExecutionConfig;
use crate::request::Request;
use crate::scheduler::{ExecutionGraph, Pipeline};
use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::{Connections, GraphLayout, NodeInfo, NodeKind, PipelineValidator};
use dagserve_core::library::LibraryRegistry;
use dagserve_core::provider::{ModelAvailabilityObserver, ModelProvider};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;

/// Lifecycle state of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionState {
    /// Constructed, never validated.
    Begin,
    /// The last validation failed; not serving.
    LoadingPreconditionFailed,
    /// Validated and serving.
    Loaded,
    /// A failed definition whose referenced models changed; revalidation
    /// may bring it up.
    LoadedRequiresRevalidation,
    /// A loaded definition whose referenced models changed; revalidation
    /// must confirm it before new executions are admitted.
    AvailableRequiringRevalidation,
    /// Retired; terminal.
    Retired,
}

impl DefinitionState {
    /// Stable state-code string.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::LoadingPreconditionFailed => "LOADING_PRECONDITION_FAILED",
            Self::Loaded => "LOADED",
            Self::LoadedRequiresRevalidation => "LOADED_REQUIRES_REVALIDATION",
            Self::AvailableRequiringRevalidation => "AVAILABLE_REQUIRING_REVALIDATION",
            Self::Retired => "RETIRED",
        }
    }

    /// Check whether the factory's revalidation pass should pick this
    /// definition up.
    #[must_use]
    pub fn requires_revalidation(&self) -> bool {
        matches!(
            self,
            Self::LoadedRequiresRevalidation | Self::AvailableRequiringRevalidation
        )
    }
}

/// One validated, immutable snapshot a definition serves from.
pub(crate) struct Blueprint {
    pub nodes: Vec<NodeInfo>,
    #[allow(dead_code)]
    pub connections: Connections,
    pub layout: GraphLayout,
    pub graph: Arc<ExecutionGraph>,
}

impl Blueprint {
    fn build(nodes: Vec<NodeInfo>, connections: Connections, layout: GraphLayout) -> Self {
        let graph = Arc::new(ExecutionGraph::build(&nodes, &connections, &layout));
        Self {
            nodes,
            connections,
            layout,
            graph,
        }
    }
}

/// The shared lifecycle state of one definition.
///
/// Held by the definition and registered with the model provider as the
/// availability observer, so a model change can flip the state without the
/// provider holding the definition itself.
pub struct DefinitionStatus {
    name: String,
    state: Mutex<DefinitionState>,
}

impl DefinitionStatus {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(DefinitionState::Begin),
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DefinitionState {
        *self.state.lock()
    }

    fn set(&self, state: DefinitionState) {
        *self.state.lock() = state;
    }
}

impl ModelAvailabilityObserver for DefinitionStatus {
    fn observer_id(&self) -> &str {
        &self.name
    }

    fn model_changed(&self, model: &str) {
        let mut state = self.state.lock();
        let next = match *state {
            DefinitionState::Loaded => DefinitionState::AvailableRequiringRevalidation,
            DefinitionState::LoadingPreconditionFailed => {
                DefinitionState::LoadedRequiresRevalidation
            }
            current => current,
        };
        if next != *state {
            tracing::info!(
                pipeline = %self.name,
                model,
                state = next.code(),
                "model availability changed, definition requires revalidation"
            );
            *state = next;
        }
    }
}

/// An immutable, validated blueprint of a pipeline DAG, plus its lifecycle.
pub struct PipelineDefinition {
    name: String,
    descriptors: RwLock<Arc<(Vec<NodeInfo>, Connections)>>,
    blueprint: RwLock<Option<Arc<Blueprint>>>,
    status: Arc<DefinitionStatus>,
    subscriptions: Mutex<HashSet<String>>,
}

impl PipelineDefinition {
    /// Create an unvalidated definition in the `Begin` state.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeInfo>, connections: Connections) -> Self {
        let name = name.into();
        Self {
            status: Arc::new(DefinitionStatus::new(name.clone())),
            name,
            descriptors: RwLock::new(Arc::new((nodes, connections))),
            blueprint: RwLock::new(None),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// The definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DefinitionState {
        self.status.state()
    }

    /// Subscribe the definition to every model it references.
    pub fn make_subscriptions(&self, provider: &dyn ModelProvider) {
        let descriptors = self.descriptors.read().clone();
        let mut subscriptions = self.subscriptions.lock();
        for node in descriptors.0.iter().filter(|n| n.kind == NodeKind::Dl) {
            if let Some(model) = &node.model_name {
                if subscriptions.insert(model.clone()) {
                    provider.subscribe(model, self.status.clone());
                }
            }
        }
    }

    /// Drop every model subscription.
    pub fn reset_subscriptions(&self, provider: &dyn ModelProvider) {
        let mut subscriptions = self.subscriptions.lock();
        for model in subscriptions.drain() {
            provider.unsubscribe(&model, &self.name);
        }
    }

    /// Validate the current descriptors and install the blueprint.
    ///
    /// Success moves the definition to `Loaded`; failure to
    /// `LoadingPreconditionFailed`.
    pub fn validate(
        &self,
        provider: &dyn ModelProvider,
        registry: &LibraryRegistry,
    ) -> Result<()> {
        if self.state() == DefinitionState::Retired {
            return Err(PipelineError::DefinitionNotLoadedAnymore {
                pipeline: self.name.clone(),
            });
        }
        let descriptors = self.descriptors.read().clone();
        match PipelineValidator::new(&self.name, &descriptors.0, &descriptors.1)
            .validate(provider, registry)
        {
            Ok(layout) => {
                let blueprint = Arc::new(Blueprint::build(
                    descriptors.0.clone(),
                    descriptors.1.clone(),
                    layout,
                ));
                *self.blueprint.write() = Some(blueprint);
                self.status.set(DefinitionState::Loaded);
                tracing::info!(pipeline = %self.name, "pipeline definition loaded");
                Ok(())
            }
            Err(error) => {
                self.status.set(DefinitionState::LoadingPreconditionFailed);
                tracing::error!(pipeline = %self.name, %error, "pipeline definition validation failed");
                Err(error)
            }
        }
    }

    /// Replace the descriptors atomically.
    ///
    /// The replacement is validated first; if it fails, the previous
    /// blueprint keeps serving (when one exists) and the error is
    /// returned. Executions holding the old blueprint finish against it
    /// either way.
    pub fn reload(
        &self,
        provider: &dyn ModelProvider,
        registry: &LibraryRegistry,
        nodes: Vec<NodeInfo>,
        connections: Connections,
    ) -> Result<()> {
        if self.state() == DefinitionState::Retired {
            return Err(PipelineError::DefinitionNotLoadedAnymore {
                pipeline: self.name.clone(),
            });
        }
        match PipelineValidator::new(&self.name, &nodes, &connections).validate(provider, registry)
        {
            Ok(layout) => {
                let blueprint = Arc::new(Blueprint::build(nodes.clone(), connections.clone(), layout));
                *self.descriptors.write() = Arc::new((nodes, connections));
                *self.blueprint.write() = Some(blueprint);
                self.reset_subscriptions(provider);
                self.make_subscriptions(provider);
                self.status.set(DefinitionState::Loaded);
                tracing::info!(pipeline = %self.name, "pipeline definition reloaded");
                Ok(())
            }
            Err(error) => {
                if self.blueprint.read().is_none() {
                    self.status.set(DefinitionState::LoadingPreconditionFailed);
                }
                tracing::error!(
                    pipeline = %self.name,
                    %error,
                    "pipeline definition reload failed, previous blueprint kept"
                );
                Err(error)
            }
        }
    }

    /// Retire the definition: unsubscribe and refuse future executions.
    ///
    /// Terminal. Executions created earlier keep their blueprint share and
    /// finish normally.
    pub fn retire(&self, provider: &dyn ModelProvider) {
        self.reset_subscriptions(provider);
        self.blueprint.write().take();
        self.status.set(DefinitionState::Retired);
        tracing::info!(pipeline = %self.name, "pipeline definition retired");
    }

    /// Construct an execution bound to `request`.
    ///
    /// Only the `Loaded` state admits new executions.
    pub fn create(
        &self,
        request: Request,
        provider: Arc<dyn ModelProvider>,
        config: &ExecutionConfig,
    ) -> Result<Pipeline> {
        match self.state() {
            DefinitionState::Loaded => {}
            DefinitionState::Retired => {
                return Err(PipelineError::DefinitionNotLoadedAnymore {
                    pipeline: self.name.clone(),
                });
            }
            _ => {
                return Err(PipelineError::DefinitionNotLoadedYet {
                    pipeline: self.name.clone(),
                });
            }
        }
        let blueprint = self.blueprint.read().clone().ok_or_else(|| {
            PipelineError::DefinitionNotLoadedYet {
                pipeline: self.name.clone(),
            }
        })?;
        Ok(Pipeline::new(
            self.name.clone(),
            &blueprint,
            request,
            provider,
            config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagserve_core::testing::{self, DummyModel, StaticModelProvider};

    fn registry() -> LibraryRegistry {
        let registry = LibraryRegistry::new();
        registry.register(testing::add_sub_library()).unwrap();
        registry
    }

    fn provider() -> StaticModelProvider {
        let provider = StaticModelProvider::new();
        provider.add_model("dummy", DummyModel::increment());
        provider
    }

    fn dl_fixture() -> (Vec<NodeInfo>, Connections) {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            NodeInfo::dl("infer", "dummy").with_output("a", "numbers"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("infer", "request", "numbers", "b")
            .with("response", "infer", "numbers", "result");
        (nodes, connections)
    }

    #[test]
    fn lifecycle_begin_to_loaded() {
        let provider = provider();
        let registry = registry();
        let (nodes, connections) = dl_fixture();
        let definition = PipelineDefinition::new("lifecycle", nodes, connections);

        assert_eq!(definition.state(), DefinitionState::Begin);
        let err = definition
            .create(Request::new(), Arc::new(provider_for_create()), &ExecutionConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEFINITION_NOT_LOADED_YET");

        definition.validate(&provider, &registry).unwrap();
        assert_eq!(definition.state(), DefinitionState::Loaded);
    }

    fn provider_for_create() -> StaticModelProvider {
        let provider = StaticModelProvider::new();
        provider.add_model("dummy", DummyModel::increment());
        provider
    }

    #[test]
    fn validation_failure_is_a_precondition_failure() {
        let provider = provider();
        let registry = registry();
        let (nodes, _) = dl_fixture();
        // No connections at all: the dl node has no inputs.
        let definition = PipelineDefinition::new("invalid", nodes, Connections::new());
        assert!(definition.validate(&provider, &registry).is_err());
        assert_eq!(definition.state(), DefinitionState::LoadingPreconditionFailed);
    }

    #[test]
    fn model_change_requires_revalidation() {
        let provider = provider();
        let registry = registry();
        let (nodes, connections) = dl_fixture();
        let definition = PipelineDefinition::new("revalidate", nodes, connections);
        definition.make_subscriptions(&provider);
        definition.validate(&provider, &registry).unwrap();

        provider.remove_model("dummy");
        assert_eq!(
            definition.state(),
            DefinitionState::AvailableRequiringRevalidation
        );
        assert!(definition.state().requires_revalidation());

        // Revalidation against the missing model fails and parks the
        // definition.
        assert!(definition.validate(&provider, &registry).is_err());
        assert_eq!(definition.state(), DefinitionState::LoadingPreconditionFailed);

        // The model coming back flips it to revalidation-required, and a
        // successful pass loads it again.
        provider.add_model("dummy", DummyModel::increment());
        assert_eq!(
            definition.state(),
            DefinitionState::LoadedRequiresRevalidation
        );
        definition.validate(&provider, &registry).unwrap();
        assert_eq!(definition.state(), DefinitionState::Loaded);
    }

    #[test]
    fn failed_reload_keeps_previous_blueprint() {
        let provider = provider();
        let registry = registry();
        let (nodes, connections) = dl_fixture();
        let definition = PipelineDefinition::new("reload", nodes.clone(), connections.clone());
        definition.make_subscriptions(&provider);
        definition.validate(&provider, &registry).unwrap();

        let err = definition
            .reload(&provider, &registry, nodes, Connections::new())
            .unwrap_err();
        assert!(err.is_validation_error());
        assert_eq!(definition.state(), DefinitionState::Loaded);
    }

    #[test]
    fn retire_is_terminal() {
        let provider = provider();
        let registry = registry();
        let (nodes, connections) = dl_fixture();
        let definition = PipelineDefinition::new("retire", nodes, connections);
        definition.make_subscriptions(&provider);
        definition.validate(&provider, &registry).unwrap();

        definition.retire(&provider);
        assert_eq!(definition.state(), DefinitionState::Retired);
        let err = definition
            .create(Request::new(), Arc::new(provider_for_create()), &ExecutionConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEFINITION_NOT_LOADED_ANYMORE");

        // A retired definition no longer reacts to model changes.
        provider.remove_model("dummy");
        assert_eq!(definition.state(), DefinitionState::Retired);
    }
}
