//! Typed edge descriptors between pipeline nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One typed edge: a source output alias feeding a destination input alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasMapping {
    /// Alias exposed by the source node.
    pub source_output: String,
    /// Input alias on the destination node.
    pub dest_input: String,
}

/// All connections of a pipeline: destination node → (source node → alias
/// mappings).
///
/// Edges are pure name descriptors; they are resolved to node indices when a
/// definition is validated, so nodes never hold back-pointers into the
/// graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connections {
    map: HashMap<String, HashMap<String, Vec<AliasMapping>>>,
}

impl Connections {
    /// Create an empty connection set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `source`'s output alias to `dest`'s input alias.
    pub fn connect(
        &mut self,
        dest: impl Into<String>,
        source: impl Into<String>,
        source_output: impl Into<String>,
        dest_input: impl Into<String>,
    ) -> &mut Self {
        self.map
            .entry(dest.into())
            .or_default()
            .entry(source.into())
            .or_default()
            .push(AliasMapping {
                source_output: source_output.into(),
                dest_input: dest_input.into(),
            });
        self
    }

    /// Builder form of [`Connections::connect`].
    #[must_use]
    pub fn with(
        mut self,
        dest: impl Into<String>,
        source: impl Into<String>,
        source_output: impl Into<String>,
        dest_input: impl Into<String>,
    ) -> Self {
        self.connect(dest, source, source_output, dest_input);
        self
    }

    /// Connections into one destination node.
    #[must_use]
    pub fn into_node(&self, dest: &str) -> Option<&HashMap<String, Vec<AliasMapping>>> {
        self.map.get(dest)
    }

    /// Iterate `(dest, source, mapping)` over every edge.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &AliasMapping)> {
        self.map.iter().flat_map(|(dest, sources)| {
            sources.iter().flat_map(move |(source, mappings)| {
                mappings
                    .iter()
                    .map(move |mapping| (dest.as_str(), source.as_str(), mapping))
            })
        })
    }

    /// Iterate destination node names.
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_query() {
        let connections = Connections::new()
            .with("exit", "adder", "sum", "final_sum")
            .with("adder", "request", "numbers", "input_numbers");

        let into_exit = connections.into_node("exit").unwrap();
        assert_eq!(into_exit["adder"].len(), 1);
        assert_eq!(into_exit["adder"][0].source_output, "sum");
        assert_eq!(into_exit["adder"][0].dest_input, "final_sum");

        assert!(connections.into_node("missing").is_none());
        assert_eq!(connections.edges().count(), 2);
    }

    #[test]
    fn multiple_aliases_between_two_nodes() {
        let connections = Connections::new()
            .with("consumer", "producer", "a", "x")
            .with("consumer", "producer", "b", "y");

        let mappings = &connections.into_node("consumer").unwrap()["producer"];
        assert_eq!(mappings.len(), 2);
    }
}
