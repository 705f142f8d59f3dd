//! The process-wide registry of pipeline definitions.

use crate::config::ExecutionConfig;
use crate::definition::{DefinitionState, PipelineDefinition};
use crate::request::Request;
use crate::scheduler::Pipeline;
use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::{Connections, NodeInfo};
use dagserve_core::library::LibraryRegistry;
use dagserve_core::provider::ModelProvider;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Concurrent registry of pipeline definitions, keyed by name.
///
/// Lookup takes the shared lock; definition creation and retirement take
/// the exclusive lock. The factory is the single process-wide piece of
/// pipeline state: initialize it during server start and retire everything
/// on shutdown.
pub struct PipelineFactory {
    definitions: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    provider: Arc<dyn ModelProvider>,
    libraries: Arc<LibraryRegistry>,
    config: ExecutionConfig,
}

impl PipelineFactory {
    /// Create a factory over a model provider and library registry.
    pub fn new(provider: Arc<dyn ModelProvider>, libraries: Arc<LibraryRegistry>) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            provider,
            libraries,
            config: ExecutionConfig::default(),
        }
    }

    /// Replace the execution configuration.
    #[must_use]
    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// The library registry definitions resolve against.
    #[must_use]
    pub fn libraries(&self) -> &Arc<LibraryRegistry> {
        &self.libraries
    }

    /// Check whether a definition exists.
    #[must_use]
    pub fn definition_exists(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    /// Look up a definition by name.
    #[must_use]
    pub fn find_definition(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// Register and validate a new definition.
    ///
    /// A definition that fails validation is not registered; its model
    /// subscriptions are rolled back and the validation error returned.
    pub fn create_definition(
        &self,
        name: impl Into<String>,
        nodes: Vec<NodeInfo>,
        connections: Connections,
    ) -> Result<()> {
        let name = name.into();
        if self.definition_exists(&name) {
            tracing::error!(pipeline = %name, "pipeline definition is already created");
            return Err(PipelineError::DefinitionAlreadyExists { pipeline: name });
        }

        let definition = PipelineDefinition::new(name.clone(), nodes, connections);
        definition.make_subscriptions(&*self.provider);
        if let Err(error) = definition.validate(&*self.provider, &self.libraries) {
            definition.reset_subscriptions(&*self.provider);
            tracing::error!(pipeline = %name, %error, "loading pipeline definition failed");
            return Err(error);
        }

        self.definitions.write().insert(name.clone(), Arc::new(definition));
        tracing::info!(pipeline = %name, "loading pipeline definition succeeded");
        Ok(())
    }

    /// Construct an execution of `name` bound to `request`.
    pub fn create(&self, name: &str, request: Request) -> Result<Pipeline> {
        let Some(definition) = self.find_definition(name) else {
            tracing::info!(pipeline = %name, "pipeline with requested name does not exist");
            return Err(PipelineError::DefinitionNameMissing {
                pipeline: name.to_string(),
            });
        };
        definition.create(request, Arc::clone(&self.provider), &self.config)
    }

    /// Replace a definition's descriptors, keeping the old blueprint on
    /// failure.
    pub fn reload_definition(
        &self,
        name: &str,
        nodes: Vec<NodeInfo>,
        connections: Connections,
    ) -> Result<()> {
        let Some(definition) = self.find_definition(name) else {
            tracing::error!(
                pipeline = %name,
                "requested to reload pipeline definition but it does not exist"
            );
            return Err(PipelineError::Unknown {
                cause: format!("cannot reload unknown pipeline definition '{}'", name),
            });
        };
        definition.reload(&*self.provider, &self.libraries, nodes, connections)
    }

    /// Retire every definition whose name is absent from `keep`.
    pub fn retire_other_than(&self, keep: &HashSet<String>) {
        let definitions = self.definitions.read();
        for (name, definition) in definitions.iter() {
            if !keep.contains(name) && definition.state() != DefinitionState::Retired {
                definition.retire(&*self.provider);
            }
        }
    }

    /// Re-run validation for every definition flagged by a model change.
    pub fn revalidate(&self) {
        let definitions: Vec<Arc<PipelineDefinition>> =
            self.definitions.read().values().cloned().collect();
        for definition in definitions {
            if definition.state().requires_revalidation() {
                match definition.validate(&*self.provider, &self.libraries) {
                    Ok(()) => tracing::debug!(
                        pipeline = %definition.name(),
                        "revalidation of pipeline succeeded"
                    ),
                    Err(error) => tracing::error!(
                        pipeline = %definition.name(),
                        %error,
                        "revalidation of pipeline definition failed"
                    ),
                }
            }
        }
    }

    /// Snapshot every definition's lifecycle state.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, DefinitionState> {
        self.definitions
            .read()
            .iter()
            .map(|(name, definition)| (name.clone(), definition.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagserve_core::testing::{self, DummyModel, StaticModelProvider};

    fn factory() -> PipelineFactory {
        let provider = Arc::new(StaticModelProvider::new());
        provider.add_model("dummy", DummyModel::increment());
        let libraries = Arc::new(LibraryRegistry::new());
        libraries.register(testing::add_sub_library()).unwrap();
        PipelineFactory::new(provider, libraries)
    }

    fn fixture() -> (Vec<NodeInfo>, Connections) {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            NodeInfo::custom("adder", "add_sub")
                .with_parameter("add_value", "1.0")
                .with_parameter("sub_value", "0.0")
                .with_output("output_numbers", "numbers"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("adder", "request", "numbers", "input_numbers")
            .with("response", "adder", "numbers", "sum");
        (nodes, connections)
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let factory = factory();
        let (nodes, connections) = fixture();
        factory
            .create_definition("ensemble", nodes.clone(), connections.clone())
            .unwrap();
        let err = factory
            .create_definition("ensemble", nodes, connections)
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEFINITION_ALREADY_EXIST");
    }

    #[test]
    fn invalid_definition_is_not_registered() {
        let factory = factory();
        let (nodes, _) = fixture();
        let err = factory
            .create_definition("broken", nodes, Connections::new())
            .unwrap_err();
        assert!(err.is_validation_error());
        assert!(!factory.definition_exists("broken"));
    }

    #[test]
    fn create_reports_missing_names() {
        let factory = factory();
        let err = factory.create("absent", Request::new()).unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEFINITION_NAME_MISSING");
    }

    #[test]
    fn retire_other_than_spares_the_keep_set() {
        let factory = factory();
        let (nodes, connections) = fixture();
        factory
            .create_definition("keep_me", nodes.clone(), connections.clone())
            .unwrap();
        factory
            .create_definition("drop_me", nodes, connections)
            .unwrap();

        let keep: HashSet<String> = ["keep_me".to_string()].into_iter().collect();
        factory.retire_other_than(&keep);

        let statuses = factory.statuses();
        assert_eq!(statuses["keep_me"], DefinitionState::Loaded);
        assert_eq!(statuses["drop_me"], DefinitionState::Retired);

        let err = factory.create("drop_me", Request::new()).unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEFINITION_NOT_LOADED_ANYMORE");
    }

    #[test]
    fn reload_unknown_definition_fails() {
        let factory = factory();
        let (nodes, connections) = fixture();
        let err = factory
            .reload_definition("absent", nodes, connections)
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_ERROR");
    }
}
