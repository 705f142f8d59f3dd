//! The per-request execution engine.
//!
//! One [`Pipeline`] executes one request against a validated blueprint.
//! Nodes are scheduled by readiness: every node instance counts the input
//! aliases it is still missing, joins the ready queue when the count hits
//! zero, and runs as a task behind a shared semaphore. Completions route
//! produced tensors downstream, which may make further instances ready.
//!
//! Demultiplexers fan one completion out into per-shard deliveries tagged
//! with extended [`SessionKey`]s; gather edges buffer shards per level and
//! collapse them back with a stacked leading axis. Inputs produced at a
//! shallower session are broadcast by reference to every sub-execution
//! they prefix.
//!
//! The first non-OK status wins: running tasks are drained (never
//! aborted), their outputs discarded, not-yet-started instances skipped.

use super::graph::ExecutionGraph;
use super::session::SessionKey;
use crate::config::ExecutionConfig;
use crate::definition::Blueprint;
use crate::nodes::RuntimeNode;
use crate::request::{Request, Response};
use dagserve_core::error::{PipelineError, Result};
use dagserve_core::graph::DemultiplyCount;
use dagserve_core::provider::ModelProvider;
use dagserve_core::tensor::{Tensor, TensorMap};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;
use uuid::Uuid;

/// A per-request executable instance of a pipeline definition.
pub struct Pipeline {
    name: String,
    execution_id: Uuid,
    nodes: Arc<Vec<RuntimeNode>>,
    graph: Arc<ExecutionGraph>,
    config: ExecutionConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

/// Result of one node-instance task.
struct TaskOutcome {
    node: usize,
    session: SessionKey,
    result: Result<TensorMap>,
}

/// Tensors received so far by one `(node, session)` instance.
#[derive(Default)]
struct InstanceState {
    inputs: TensorMap,
}

/// Shards collected for one gathered input, one level at a time.
struct GatherBuffer {
    slots: Vec<Option<Tensor>>,
    filled: usize,
}

/// All mutable bookkeeping of one execution.
#[derive(Default)]
struct ExecutionState {
    instances: HashMap<(usize, SessionKey), InstanceState>,
    started: HashSet<(usize, SessionKey)>,
    ready: VecDeque<(usize, SessionKey)>,
    /// Tensors produced at a shallower session than their consumers,
    /// shared by reference into every matching sub-execution.
    broadcasts: HashMap<(usize, String), Vec<(SessionKey, Tensor)>>,
    /// Keyed by `(gather node, parent session, input alias)`.
    gather_buffers: HashMap<(usize, SessionKey, String), GatherBuffer>,
    exit_outputs: Option<TensorMap>,
}

impl Pipeline {
    pub(crate) fn new(
        name: String,
        blueprint: &Blueprint,
        request: Request,
        provider: Arc<dyn ModelProvider>,
        config: ExecutionConfig,
    ) -> Self {
        let request = Arc::new(request);
        let graph = Arc::clone(&blueprint.graph);
        let nodes: Vec<RuntimeNode> = blueprint
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, info)| {
                RuntimeNode::build(
                    info,
                    blueprint.layout.libraries[idx].clone(),
                    graph.required_aliases[idx].clone(),
                    &request,
                    &provider,
                )
            })
            .collect();

        Self {
            name,
            execution_id: Uuid::new_v4(),
            nodes: Arc::new(nodes),
            graph,
            config,
        }
    }

    /// The unique id of this execution, used in logs.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Execute the pipeline to completion.
    ///
    /// Returns the response on success, or the first non-OK status any node
    /// reported. Either way every node that was running when the outcome
    /// was decided has finished before this returns.
    #[instrument(
        skip(self),
        fields(pipeline = %self.name, execution = %self.execution_id)
    )]
    pub async fn execute(self) -> Result<Response> {
        let started_at = tokio::time::Instant::now();
        let deadline = started_at + Duration::from_millis(self.config.deadline_ms);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_nodes));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut state = ExecutionState::default();
        let mut first_error: Option<PipelineError> = None;

        tracing::debug!(nodes = self.nodes.len(), "starting pipeline execution");

        // The entry node has no inputs; seed it ready at the root session.
        let entry_key = (self.graph.entry, SessionKey::root());
        state.started.insert(entry_key.clone());
        state.instances.insert(entry_key.clone(), InstanceState::default());
        state.ready.push_back(entry_key);

        loop {
            while let Some((node, session)) = state.ready.pop_front() {
                if first_error.is_some() {
                    tracing::debug!(
                        node = %self.graph.names[node],
                        session = %session,
                        "skipping node after earlier failure"
                    );
                    continue;
                }
                let inputs = state
                    .instances
                    .remove(&(node, session.clone()))
                    .map(|instance| instance.inputs)
                    .unwrap_or_default();

                let nodes = Arc::clone(&self.nodes);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("semaphore is never closed");
                    let result =
                        match tokio::time::timeout_at(deadline, nodes[node].execute(inputs)).await
                        {
                            Ok(result) => result,
                            Err(_elapsed) => Err(PipelineError::DeadlineExceeded {
                                node: nodes[node].name().to_string(),
                            }),
                        };
                    TaskOutcome {
                        node,
                        session,
                        result,
                    }
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    first_error.get_or_insert(PipelineError::Unknown {
                        cause: format!("node task failed to join: {}", join_error),
                    });
                    continue;
                }
            };

            match outcome.result {
                Ok(outputs) => {
                    if first_error.is_some() {
                        // The pipeline already failed; this node was allowed
                        // to finish but its outputs are discarded.
                        continue;
                    }
                    tracing::debug!(
                        node = %self.graph.names[outcome.node],
                        session = %outcome.session,
                        "node completed"
                    );
                    if outcome.node == self.graph.exit {
                        state.exit_outputs = Some(outputs);
                    } else if let Err(error) =
                        self.route_outputs(outcome.node, &outcome.session, outputs, &mut state)
                    {
                        first_error.get_or_insert(error);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        node = %self.graph.names[outcome.node],
                        session = %outcome.session,
                        %error,
                        "node failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            tracing::warn!(%error, "pipeline execution failed");
            return Err(error);
        }

        let outputs = state.exit_outputs.ok_or_else(|| PipelineError::Unknown {
            cause: "exit node never became ready".to_string(),
        })?;
        tracing::info!(
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            outputs = outputs.len(),
            "pipeline execution succeeded"
        );
        Ok(Response { outputs })
    }

    /// Route one completed node's outputs to its downstream instances.
    fn route_outputs(
        &self,
        node: usize,
        session: &SessionKey,
        outputs: TensorMap,
        state: &mut ExecutionState,
    ) -> Result<()> {
        if let Some(declared) = self.graph.demultiply[node] {
            let count = self.demultiply_count(node, declared, &outputs)?;

            let requested = session.shard_product() * count;
            if requested > self.config.max_total_shards {
                return Err(PipelineError::DemultiplexerLimitExceeded {
                    requested,
                    limit: self.config.max_total_shards,
                });
            }

            for index in 0..count {
                let child = session.child(node, index as usize, count as usize);
                let mut shard_outputs = TensorMap::with_capacity(outputs.len());
                for (alias, tensor) in &outputs {
                    shard_outputs.insert(alias.clone(), tensor.shard(index)?);
                }
                self.deliver_downstream(node, &child, &shard_outputs, state)?;
            }
            Ok(())
        } else {
            self.deliver_downstream(node, session, &outputs, state)
        }
    }

    /// Resolve and check the shard count a demultiplexer produced.
    fn demultiply_count(
        &self,
        node: usize,
        declared: DemultiplyCount,
        outputs: &TensorMap,
    ) -> Result<u64> {
        let node_name = &self.graph.names[node];
        let mut first_dims = outputs.iter().map(|(alias, tensor)| {
            (alias, tensor.shape().first().copied().unwrap_or(0), tensor.shape().len())
        });

        let (_, leading, _) = first_dims
            .next()
            .ok_or_else(|| PipelineError::Unknown {
                cause: format!("demultiplexer '{}' produced no outputs", node_name),
            })?;
        let count = match declared {
            DemultiplyCount::Static(count) => count as u64,
            DemultiplyCount::Dynamic => leading,
        };

        for (alias, leading, rank) in outputs.iter().map(|(alias, tensor)| {
            (alias, tensor.shape().first().copied().unwrap_or(0), tensor.shape().len())
        }) {
            if rank < 2 {
                return Err(PipelineError::InvalidTensor {
                    cause: format!(
                        "demultiplexer '{}' output '{}' needs at least two dimensions to shard",
                        node_name, alias
                    ),
                });
            }
            if leading != count {
                return Err(PipelineError::DemultiplyCountMismatch {
                    node: node_name.clone(),
                    expected: count,
                    actual: leading,
                });
            }
        }
        Ok(count)
    }

    fn deliver_downstream(
        &self,
        node: usize,
        session: &SessionKey,
        outputs: &TensorMap,
        state: &mut ExecutionState,
    ) -> Result<()> {
        for edge in &self.graph.downstream[node] {
            for (source_alias, dest_input) in &edge.mappings {
                let tensor = outputs.get(source_alias).ok_or_else(|| {
                    PipelineError::Unknown {
                        cause: format!(
                            "node '{}' did not produce routed alias '{}'",
                            self.graph.names[node], source_alias
                        ),
                    }
                })?;
                self.deliver(
                    edge.to,
                    dest_input,
                    tensor.clone(),
                    session.clone(),
                    edge.gathered_levels,
                    state,
                )?;
            }
        }
        Ok(())
    }

    /// Deliver one tensor to one consumer, collapsing gathered levels on
    /// the way and broadcasting shallow tensors into deeper sub-executions.
    fn deliver(
        &self,
        to: usize,
        alias: &str,
        tensor: Tensor,
        session: SessionKey,
        gathered_levels: usize,
        state: &mut ExecutionState,
    ) -> Result<()> {
        if gathered_levels > 0 {
            let (parent, coord) = session.split_parent().ok_or_else(|| {
                PipelineError::Unknown {
                    cause: "gathered delivery at the root session".to_string(),
                }
            })?;
            let key = (to, parent.clone(), alias.to_string());
            let buffer = state
                .gather_buffers
                .entry(key.clone())
                .or_insert_with(|| GatherBuffer {
                    slots: vec![None; coord.count],
                    filled: 0,
                });
            if buffer.slots[coord.index].replace(tensor).is_none() {
                buffer.filled += 1;
            }
            if buffer.filled == buffer.slots.len() {
                let buffer = state.gather_buffers.remove(&key).expect("buffer present");
                let shards: Vec<Tensor> = buffer
                    .slots
                    .into_iter()
                    .map(|slot| slot.expect("buffer is full"))
                    .collect();
                let stacked = Tensor::stack(&shards).map_err(|error| {
                    PipelineError::GatherShapeMismatch {
                        node: self.graph.names[to].clone(),
                        cause: error.to_string(),
                    }
                })?;
                self.deliver(to, alias, stacked, parent, gathered_levels - 1, state)?;
            }
            return Ok(());
        }

        let depth = self.graph.level_depth[to];
        if session.depth() < depth {
            // Shallower than the consumer: a by-reference broadcast into
            // every sub-execution this session prefixes.
            for ((node, instance_session), instance) in state.instances.iter_mut() {
                if *node == to
                    && session.is_prefix_of(instance_session)
                    && !instance.inputs.contains_key(alias)
                {
                    instance.inputs.insert(alias.to_string(), tensor.clone());
                }
            }
            let ready: Vec<(usize, SessionKey)> = state
                .instances
                .iter()
                .filter(|((node, _), instance)| {
                    *node == to && instance.inputs.len() == self.graph.expected_inputs[to]
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in ready {
                if state.started.insert(key.clone()) {
                    state.ready.push_back(key);
                }
            }
            state
                .broadcasts
                .entry((to, alias.to_string()))
                .or_default()
                .push((session, tensor));
            return Ok(());
        }

        let key = (to, session);
        if !state.instances.contains_key(&key) && !state.started.contains(&key) {
            // First full-depth delivery creates the instance, seeded with
            // every broadcast that prefixes it.
            let mut inputs = TensorMap::new();
            for ((node, broadcast_alias), entries) in &state.broadcasts {
                if *node != to {
                    continue;
                }
                for (broadcast_session, broadcast_tensor) in entries {
                    if broadcast_session.is_prefix_of(&key.1) {
                        inputs.insert(broadcast_alias.clone(), broadcast_tensor.clone());
                    }
                }
            }
            state.instances.insert(key.clone(), InstanceState { inputs });
        }
        let Some(instance) = state.instances.get_mut(&key) else {
            return Err(PipelineError::Unknown {
                cause: format!(
                    "delivery to already-started node '{}'",
                    self.graph.names[to]
                ),
            });
        };
        if instance.inputs.insert(alias.to_string(), tensor).is_some() {
            return Err(PipelineError::Unknown {
                cause: format!(
                    "input alias '{}' of node '{}' delivered twice",
                    alias, self.graph.names[to]
                ),
            });
        }
        if instance.inputs.len() == self.graph.expected_inputs[to] && state.started.insert(key.clone())
        {
            state.ready.push_back(key);
        }
        Ok(())
    }
}
