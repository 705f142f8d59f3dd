//! Index-resolved execution graph.
//!
//! Built once per validated blueprint from the descriptors and the
//! [`GraphLayout`]; the per-request scheduler only ever works with node
//! indices and pre-grouped edges.

use dagserve_core::graph::{Connections, DemultiplyCount, GraphLayout, NodeInfo};
use std::collections::{BTreeSet, HashMap};

/// Edges from one source node to one destination, grouped.
#[derive(Debug, Clone)]
pub(crate) struct EdgeTarget {
    /// Destination node index.
    pub to: usize,
    /// How many demultiplex levels collapse on this edge (non-zero only
    /// for edges into a gather node).
    pub gathered_levels: usize,
    /// `(source output alias, destination input alias)` pairs.
    pub mappings: Vec<(String, String)>,
}

/// The resolved graph one pipeline executes over.
#[derive(Debug)]
pub(crate) struct ExecutionGraph {
    /// Node names, by index.
    pub names: Vec<String>,
    /// Demultiplex declaration per node.
    pub demultiply: Vec<Option<DemultiplyCount>>,
    /// Outgoing edges per node.
    pub downstream: Vec<Vec<EdgeTarget>>,
    /// Distinct input aliases each node waits for.
    pub expected_inputs: Vec<usize>,
    /// Demultiplex depth each node executes at.
    pub level_depth: Vec<usize>,
    /// Output aliases of each node that downstream edges reference.
    pub required_aliases: Vec<Vec<String>>,
    /// Entry node index.
    pub entry: usize,
    /// Exit node index.
    pub exit: usize,
}

impl ExecutionGraph {
    /// Resolve descriptors and layout into an execution graph.
    pub fn build(nodes: &[NodeInfo], connections: &Connections, layout: &GraphLayout) -> Self {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.name.as_str(), idx))
            .collect();

        let mut downstream: Vec<Vec<EdgeTarget>> = vec![Vec::new(); nodes.len()];
        let mut required: Vec<BTreeSet<String>> = vec![BTreeSet::new(); nodes.len()];

        for (dest, source, mapping) in connections.edges() {
            let to = index[dest];
            let from = index[source];
            let effective_depth =
                layout.levels[from].len() + usize::from(nodes[from].is_demultiplexer());
            let gathered_levels = if nodes[to].is_gather() {
                effective_depth.saturating_sub(layout.levels[to].len())
            } else {
                0
            };

            let targets = &mut downstream[from];
            let target = match targets.iter_mut().find(|target| target.to == to) {
                Some(target) => target,
                None => {
                    targets.push(EdgeTarget {
                        to,
                        gathered_levels,
                        mappings: Vec::new(),
                    });
                    targets.last_mut().expect("just pushed")
                }
            };
            target
                .mappings
                .push((mapping.source_output.clone(), mapping.dest_input.clone()));
            required[from].insert(mapping.source_output.clone());
        }

        Self {
            names: nodes.iter().map(|node| node.name.clone()).collect(),
            demultiply: nodes.iter().map(|node| node.demultiply).collect(),
            downstream,
            expected_inputs: layout.expected_inputs.clone(),
            level_depth: layout.levels.iter().map(Vec::len).collect(),
            required_aliases: required
                .into_iter()
                .map(|aliases| aliases.into_iter().collect())
                .collect(),
            entry: layout.entry,
            exit: layout.exit,
        }
    }
}
