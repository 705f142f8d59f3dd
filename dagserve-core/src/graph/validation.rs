//! Structural validation of pipeline definitions.
//!
//! Validation runs the checks of a definition in a fixed order: node-name
//! uniqueness, entry/exit cardinality, connection well-formedness, model
//! references, library references, acyclicity, then demultiplexer/gather
//! topology. The first failing check is returned. A successful run produces
//! a [`GraphLayout`]: the index-resolved facts (topological order, per-node
//! demultiplex levels, demultiplexer↔gather matching, resolved library
//! handles) the execution engine schedules from, so nothing is re-derived
//! per request.

use super::connection::Connections;
use super::node_info::{DemultiplyCount, NodeInfo, NodeKind};
use crate::error::{PipelineError, Result};
use crate::library::{LibraryRegistry, NodeLibrary};
use crate::provider::ModelProvider;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Index-resolved layout of a validated pipeline graph.
#[derive(Debug, Clone)]
pub struct GraphLayout {
    /// Node indices in topological order.
    pub order: Vec<usize>,
    /// Per node: the demultiplexers it executes under, outermost first.
    pub levels: Vec<Vec<usize>>,
    /// Demultiplexer index → index of the gather node that declares it.
    pub gather_for: HashMap<usize, usize>,
    /// Index of the entry node.
    pub entry: usize,
    /// Index of the exit node.
    pub exit: usize,
    /// Per node: number of distinct input aliases it waits for.
    pub expected_inputs: Vec<usize>,
    /// Per node: the resolved library handle, for custom nodes.
    pub libraries: Vec<Option<Arc<NodeLibrary>>>,
}

/// Validator for one pipeline definition.
pub struct PipelineValidator<'a> {
    pipeline: &'a str,
    nodes: &'a [NodeInfo],
    connections: &'a Connections,
    index: HashMap<&'a str, usize>,
}

impl<'a> PipelineValidator<'a> {
    /// Create a validator over a definition's descriptors.
    #[must_use]
    pub fn new(pipeline: &'a str, nodes: &'a [NodeInfo], connections: &'a Connections) -> Self {
        Self {
            pipeline,
            nodes,
            connections,
            index: HashMap::new(),
        }
    }

    /// Run every check in order and produce the layout.
    pub fn validate(
        mut self,
        provider: &dyn ModelProvider,
        registry: &LibraryRegistry,
    ) -> Result<GraphLayout> {
        self.build_index()?;
        let (entry, exit) = self.check_entry_exit()?;
        let expected_inputs = self.check_connections(entry)?;
        self.check_models(provider)?;
        let libraries = self.check_libraries(registry)?;
        let order = self.topological_sort()?;
        let (levels, gather_for) = self.check_demultiplex_topology(&order, entry, exit)?;

        Ok(GraphLayout {
            order,
            levels,
            gather_for,
            entry,
            exit,
            expected_inputs,
            libraries,
        })
    }

    fn err_connection(&self, node: &str, cause: impl Into<String>) -> PipelineError {
        PipelineError::ConnectionInvalid {
            pipeline: self.pipeline.to_string(),
            node: node.to_string(),
            cause: cause.into(),
        }
    }

    fn err_levels(&self, node: &str, cause: impl Into<String>) -> PipelineError {
        PipelineError::DemultiplexLevelsMismatch {
            pipeline: self.pipeline.to_string(),
            node: node.to_string(),
            cause: cause.into(),
        }
    }

    fn build_index(&mut self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if self.index.insert(node.name.as_str(), idx).is_some() {
                return Err(PipelineError::NodeNameDuplicate {
                    pipeline: self.pipeline.to_string(),
                    node: node.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_entry_exit(&self) -> Result<(usize, usize)> {
        let entries: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Entry)
            .map(|(i, _)| i)
            .collect();
        let exits: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Exit)
            .map(|(i, _)| i)
            .collect();

        if entries.len() > 1 {
            return Err(PipelineError::MultipleEntryNodes {
                pipeline: self.pipeline.to_string(),
            });
        }
        if exits.len() > 1 {
            return Err(PipelineError::MultipleExitNodes {
                pipeline: self.pipeline.to_string(),
            });
        }
        match (entries.first(), exits.first()) {
            (Some(&entry), Some(&exit)) => Ok((entry, exit)),
            _ => Err(PipelineError::MissingEntryOrExit {
                pipeline: self.pipeline.to_string(),
            }),
        }
    }

    fn check_connections(&self, entry: usize) -> Result<Vec<usize>> {
        let mut expected_inputs = vec![0usize; self.nodes.len()];
        let mut used_as_source = HashSet::new();

        for (dest, sources) in self
            .nodes
            .iter()
            .filter_map(|n| self.connections.into_node(&n.name).map(|s| (n, s)))
        {
            let mut seen_inputs = HashSet::new();
            for (source, mappings) in sources {
                let source_idx = *self
                    .index
                    .get(source.as_str())
                    .ok_or_else(|| {
                        self.err_connection(
                            &dest.name,
                            format!("source node '{}' is not declared", source),
                        )
                    })?;
                let source_node = &self.nodes[source_idx];
                if source_node.kind == NodeKind::Exit {
                    return Err(
                        self.err_connection(&dest.name, "the exit node cannot produce outputs")
                    );
                }
                used_as_source.insert(source_idx);
                for mapping in mappings {
                    if !source_node.has_output_alias(&mapping.source_output) {
                        return Err(self.err_connection(
                            &dest.name,
                            format!(
                                "source node '{}' does not expose output alias '{}'",
                                source, mapping.source_output
                            ),
                        ));
                    }
                    if !seen_inputs.insert(mapping.dest_input.as_str()) {
                        return Err(self.err_connection(
                            &dest.name,
                            format!("input alias '{}' is bound more than once", mapping.dest_input),
                        ));
                    }
                }
            }
            if dest.kind == NodeKind::Entry {
                return Err(self.err_connection(&dest.name, "the entry node cannot receive inputs"));
            }
            expected_inputs[self.index[dest.name.as_str()]] = seen_inputs.len();
        }

        // Any destination name in the connection map that is not a declared
        // node would be silently unreachable above; reject it explicitly.
        for dest in self.connections.destinations() {
            if !self.index.contains_key(dest) {
                return Err(self.err_connection(dest, "destination node is not declared"));
            }
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            if idx != entry && expected_inputs[idx] == 0 {
                return Err(self.err_connection(&node.name, "node has no connected inputs"));
            }
            if node.kind != NodeKind::Exit && !used_as_source.contains(&idx) {
                tracing::warn!(
                    pipeline = %self.pipeline,
                    node = %node.name,
                    "node outputs are not consumed by any connection"
                );
            }

            if let Some(DemultiplyCount::Static(0)) = node.demultiply {
                return Err(self.err_connection(&node.name, "demultiply count must be positive"));
            }
            if node.is_demultiplexer() && node.kind == NodeKind::Exit {
                return Err(self.err_connection(&node.name, "the exit node cannot demultiplex"));
            }
            if node.is_gather() && node.kind != NodeKind::Custom {
                return Err(self.err_connection(&node.name, "only custom nodes may gather"));
            }
            for from in &node.gather_from {
                let from_idx = self.index.get(from.as_str()).copied();
                let demultiplexes =
                    from_idx.is_some_and(|i| self.nodes[i].is_demultiplexer());
                if !demultiplexes {
                    return Err(PipelineError::GatherWithoutDemultiplexer {
                        pipeline: self.pipeline.to_string(),
                        node: node.name.clone(),
                        from: from.clone(),
                    });
                }
            }
        }

        Ok(expected_inputs)
    }

    fn check_models(&self, provider: &dyn ModelProvider) -> Result<()> {
        for node in self.nodes.iter().filter(|n| n.kind == NodeKind::Dl) {
            let model = node.model_name.as_deref().ok_or_else(|| {
                self.err_connection(&node.name, "dl node does not reference a model")
            })?;
            provider.get_instance(model, node.model_version)?;
        }
        Ok(())
    }

    fn check_libraries(&self, registry: &LibraryRegistry) -> Result<Vec<Option<Arc<NodeLibrary>>>> {
        let mut libraries = vec![None; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.kind != NodeKind::Custom {
                continue;
            }
            let library_name = node.library_name.as_deref().ok_or_else(|| {
                self.err_connection(&node.name, "custom node does not reference a library")
            })?;
            let library = registry.get(library_name)?;

            // The library is in-process, so its declared inputs are cheap to
            // compare against the aliases the connections actually bind.
            let declared = library.inputs_info(&node.parameter_pairs())?;
            if !declared.is_empty() {
                let declared_names: HashSet<&str> =
                    declared.iter().map(|info| info.name.as_str()).collect();
                let bound: HashSet<&str> = self
                    .connections
                    .into_node(&node.name)
                    .into_iter()
                    .flat_map(|sources| sources.values())
                    .flatten()
                    .map(|mapping| mapping.dest_input.as_str())
                    .collect();
                if declared_names != bound {
                    return Err(PipelineError::LibraryInputsMismatch {
                        node: node.name.clone(),
                        cause: format!(
                            "library declares inputs {:?}, connections bind {:?}",
                            sorted(&declared_names),
                            sorted(&bound)
                        ),
                    });
                }
            }
            libraries[idx] = Some(library);
        }
        Ok(libraries)
    }

    /// Kahn's algorithm over the connection edges.
    fn topological_sort(&self) -> Result<Vec<usize>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (dest, source, _) in self.connections.edges() {
            let dest = self.index[dest];
            let source = self.index[source];
            in_degree[dest] += 1;
            outgoing[source].push(dest);
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for &next in &outgoing[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let cyclic: Vec<String> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(idx, _)| !sorted.contains(idx))
                .map(|(_, node)| node.name.clone())
                .collect();
            return Err(PipelineError::CycleFound {
                pipeline: self.pipeline.to_string(),
                nodes: cyclic,
            });
        }
        Ok(sorted)
    }

    /// Match every demultiplexer to its gather and assign each node the
    /// stack of demultiplexers it executes under.
    ///
    /// Walking the topological order: a node's effective level is the
    /// longest level among its inputs, and every other input must sit at a
    /// prefix of it (those are the by-reference broadcasts into the
    /// region). A gather strips the levels it declares, which must be
    /// exactly the innermost ones its gathered inputs carry. Anything else
    /// is an edge crossing a region boundary without passing through the
    /// demultiplexer or its gather.
    fn check_demultiplex_topology(
        &self,
        order: &[usize],
        entry: usize,
        exit: usize,
    ) -> Result<(Vec<Vec<usize>>, HashMap<usize, usize>)> {
        let mut gather_for: HashMap<usize, usize> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for from in &node.gather_from {
                let demux = self.index[from.as_str()];
                if gather_for.insert(demux, idx).is_some() {
                    return Err(self.err_levels(
                        from,
                        "demultiplexer is declared by more than one gather node",
                    ));
                }
            }
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.is_demultiplexer() && !gather_for.contains_key(&idx) {
                return Err(PipelineError::DemultiplexerWithoutGather {
                    pipeline: self.pipeline.to_string(),
                    node: node.name.clone(),
                });
            }
        }

        let mut levels: Vec<Option<Vec<usize>>> = vec![None; self.nodes.len()];
        levels[entry] = Some(Vec::new());

        for &v in order {
            if v == entry {
                continue;
            }
            let node = &self.nodes[v];
            let gathered: HashSet<usize> = node
                .gather_from
                .iter()
                .map(|from| self.index[from.as_str()])
                .collect();

            let mut inbound: Vec<Vec<usize>> = Vec::new();
            if let Some(sources) = self.connections.into_node(&node.name) {
                for source in sources.keys() {
                    let u = self.index[source.as_str()];
                    let mut eff = levels[u]
                        .clone()
                        .expect("topological order visits sources first");
                    if self.nodes[u].is_demultiplexer() {
                        eff.push(u);
                    }
                    inbound.push(eff);
                }
            }

            let resolved = if gathered.is_empty() {
                self.resolve_plain_levels(node, inbound)?
            } else {
                self.resolve_gather_levels(node, &gathered, inbound)?
            };
            levels[v] = Some(resolved);
        }

        let exit_levels = levels[exit].clone().unwrap_or_default();
        if !exit_levels.is_empty() {
            let names: Vec<&str> = exit_levels
                .iter()
                .map(|&idx| self.nodes[idx].name.as_str())
                .collect();
            return Err(self.err_levels(
                &self.nodes[exit].name,
                format!("demultiplexed levels {:?} reach the exit ungathered", names),
            ));
        }

        let levels = levels.into_iter().map(Option::unwrap_or_default).collect();
        Ok((levels, gather_for))
    }

    fn resolve_plain_levels(
        &self,
        node: &NodeInfo,
        inbound: Vec<Vec<usize>>,
    ) -> Result<Vec<usize>> {
        let mut longest: Vec<usize> = Vec::new();
        for eff in inbound {
            if eff.len() > longest.len() {
                if !eff.starts_with(&longest) {
                    return Err(self.err_levels(
                        &node.name,
                        "inputs arrive from incompatible demultiplex levels",
                    ));
                }
                longest = eff;
            } else if !longest.starts_with(&eff) {
                return Err(self.err_levels(
                    &node.name,
                    "inputs arrive from incompatible demultiplex levels",
                ));
            }
        }
        Ok(longest)
    }

    fn resolve_gather_levels(
        &self,
        node: &NodeInfo,
        gathered: &HashSet<usize>,
        inbound: Vec<Vec<usize>>,
    ) -> Result<Vec<usize>> {
        let mut base: Option<Vec<usize>> = None;
        let mut prefixes: Vec<Vec<usize>> = Vec::new();

        for eff in inbound {
            let carried = eff.iter().filter(|idx| gathered.contains(idx)).count();
            if carried == 0 {
                prefixes.push(eff);
                continue;
            }
            if carried != gathered.len() || eff.len() < gathered.len() {
                return Err(self.err_levels(
                    &node.name,
                    "gathered input does not carry every declared demultiplex level",
                ));
            }
            let (stripped, suffix) = eff.split_at(eff.len() - gathered.len());
            if !suffix.iter().all(|idx| gathered.contains(idx)) {
                return Err(self.err_levels(
                    &node.name,
                    "declared demultiplex levels are not the innermost levels of the gathered input",
                ));
            }
            match &base {
                Some(existing) if existing.as_slice() != stripped => {
                    return Err(self.err_levels(
                        &node.name,
                        "gathered inputs disagree on the remaining demultiplex levels",
                    ));
                }
                Some(_) => {}
                None => base = Some(stripped.to_vec()),
            }
        }

        let base = base.ok_or_else(|| {
            self.err_levels(&node.name, "no input carries the declared demultiplex levels")
        })?;
        for eff in prefixes {
            if !base.starts_with(&eff) {
                return Err(self.err_levels(
                    &node.name,
                    "inputs arrive from incompatible demultiplex levels",
                ));
            }
        }
        Ok(base)
    }
}

fn sorted<'a>(set: &HashSet<&'a str>) -> Vec<&'a str> {
    let mut names: Vec<&str> = set.iter().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, StaticModelProvider};

    fn registry() -> LibraryRegistry {
        let registry = LibraryRegistry::new();
        registry.register(testing::add_sub_library()).unwrap();
        registry.register(testing::different_ops_library()).unwrap();
        registry.register(testing::choose_maximum_library()).unwrap();
        registry
    }

    fn provider() -> StaticModelProvider {
        let provider = StaticModelProvider::new();
        provider.add_model("dummy", testing::DummyModel::increment());
        provider
    }

    fn add_sub_node(name: &str) -> NodeInfo {
        NodeInfo::custom(name, "add_sub")
            .with_parameter("add_value", "1.0")
            .with_parameter("sub_value", "1.0")
            .with_output("output_numbers", "numbers")
    }

    fn linear_fixture() -> (Vec<NodeInfo>, Connections) {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            add_sub_node("adder"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("adder", "request", "numbers", "input_numbers")
            .with("response", "adder", "numbers", "numbers");
        (nodes, connections)
    }

    #[test]
    fn accepts_linear_pipeline() {
        let (nodes, connections) = linear_fixture();
        let layout = PipelineValidator::new("linear", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap();
        assert_eq!(layout.entry, 0);
        assert_eq!(layout.exit, 2);
        assert_eq!(layout.order.len(), 3);
        assert_eq!(layout.expected_inputs, vec![0, 1, 1]);
        assert!(layout.libraries[1].is_some());
        assert!(layout.levels.iter().all(Vec::is_empty));
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let (mut nodes, connections) = linear_fixture();
        nodes.push(add_sub_node("adder"));
        let err = PipelineValidator::new("dup", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_NODE_NAME_DUPLICATE");
    }

    #[test]
    fn rejects_missing_entry_or_exit() {
        let nodes = vec![add_sub_node("adder"), NodeInfo::exit("response")];
        let connections = Connections::new().with("response", "adder", "numbers", "numbers");
        let err = PipelineValidator::new("no_entry", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_MISSING_ENTRY_OR_EXIT");
    }

    #[test]
    fn rejects_unknown_source_alias() {
        let (nodes, _) = linear_fixture();
        let connections = Connections::new()
            .with("adder", "request", "wrong_alias", "input_numbers")
            .with("response", "adder", "numbers", "numbers");
        let err = PipelineValidator::new("bad_alias", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_CONNECTION_INVALID");
    }

    #[test]
    fn rejects_input_bound_twice() {
        let (mut nodes, mut connections) = linear_fixture();
        nodes.push(add_sub_node("adder2"));
        connections.connect("adder", "adder2", "numbers", "input_numbers");
        connections.connect("adder2", "request", "numbers", "input_numbers");
        let err = PipelineValidator::new("double_bind", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_CONNECTION_INVALID");
    }

    #[test]
    fn rejects_cycles() {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            add_sub_node("a"),
            add_sub_node("b"),
            NodeInfo::exit("response"),
        ];
        // a and b feed each other; neither can ever become ready.
        let connections = Connections::new()
            .with("a", "b", "numbers", "input_numbers")
            .with("b", "a", "numbers", "input_numbers")
            .with("response", "b", "numbers", "numbers");
        let err = PipelineValidator::new("cyclic", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_CYCLE_FOUND");
    }

    #[test]
    fn rejects_missing_model() {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            NodeInfo::dl("infer", "absent_model").with_output("a", "numbers"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("infer", "request", "numbers", "b")
            .with("response", "infer", "numbers", "numbers");
        let err = PipelineValidator::new("no_model", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "MODEL_MISSING");
    }

    #[test]
    fn rejects_missing_library() {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers"]),
            NodeInfo::custom("mystery", "unregistered").with_output("out", "numbers"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("mystery", "request", "numbers", "input_numbers")
            .with("response", "mystery", "numbers", "numbers");
        let err = PipelineValidator::new("no_lib", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_NAME_MISSING");
    }

    #[test]
    fn rejects_library_input_disagreement() {
        let (nodes, _) = linear_fixture();
        // add_sub declares exactly one input named input_numbers.
        let connections = Connections::new()
            .with("adder", "request", "numbers", "unexpected_name")
            .with("response", "adder", "numbers", "numbers");
        let err = PipelineValidator::new("bad_inputs", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "NODE_LIBRARY_INPUTS_MISMATCH");
    }

    fn demux_fixture() -> (Vec<NodeInfo>, Connections) {
        let nodes = vec![
            NodeInfo::entry("request", ["numbers", "factors"]),
            NodeInfo::custom("ops", "different_ops")
                .with_output("different_ops_results", "results")
                .with_demultiply(4),
            NodeInfo::dl("infer", "dummy").with_output("a", "inferred"),
            NodeInfo::custom("pick", "choose_maximum")
                .with_parameter("selection_criteria", "MAXIMUM_MINIMUM")
                .with_output("maximum_tensor", "best")
                .with_gather_from("ops"),
            NodeInfo::exit("response"),
        ];
        let connections = Connections::new()
            .with("ops", "request", "numbers", "input_numbers")
            .with("ops", "request", "factors", "op_factors")
            .with("infer", "ops", "results", "b")
            .with("pick", "infer", "inferred", "input_tensors")
            .with("response", "pick", "best", "best");
        (nodes, connections)
    }

    #[test]
    fn demultiplex_levels_are_assigned() {
        let (nodes, connections) = demux_fixture();
        let layout = PipelineValidator::new("demux", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap();
        // ops demultiplexes, so the dl node runs one level deep.
        assert!(layout.levels[1].is_empty());
        assert_eq!(layout.levels[2], vec![1]);
        // The gather and the exit are back at the base level.
        assert!(layout.levels[3].is_empty());
        assert!(layout.levels[4].is_empty());
        assert_eq!(layout.gather_for[&1], 3);
    }

    #[test]
    fn rejects_demultiplexer_without_gather() {
        let (mut nodes, connections) = demux_fixture();
        nodes[3].gather_from.clear();
        let err = PipelineValidator::new("no_gather", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEMULTIPLEXER_WITHOUT_GATHER");
    }

    #[test]
    fn rejects_gather_from_non_demultiplexer() {
        let (mut nodes, connections) = demux_fixture();
        nodes[1].demultiply = None;
        let err = PipelineValidator::new("bad_gather", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_GATHER_WITHOUT_DEMULTIPLEXER");
    }

    #[test]
    fn rejects_shard_output_escaping_region() {
        let (mut nodes, mut connections) = demux_fixture();
        // Route the demultiplexed dl output straight to the exit, bypassing
        // the gather.
        nodes[4] = NodeInfo::exit("response");
        connections.connect("response", "infer", "inferred", "leak");
        let err = PipelineValidator::new("leak", &nodes, &connections)
            .validate(&provider(), &registry())
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_DEMULTIPLEX_LEVELS_MISMATCH");
    }
}
