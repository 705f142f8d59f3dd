//! Node descriptors: one vertex of the pipeline graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The variant of a pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Materializes request tensors into the graph.
    Entry,
    /// Collects tensors into the response.
    Exit,
    /// Runs a deep-learning model through the model provider.
    Dl,
    /// Runs a custom-node library.
    Custom,
}

/// Demultiplex fan-out declared by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemultiplyCount {
    /// Fixed shard count; the produced leading dimension must match.
    Static(u32),
    /// Shard count taken from the first dimension of the produced outputs.
    Dynamic,
}

/// Maps a producer-local output name to its externally visible alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    /// Name the producer uses (model output name, library output name,
    /// request input name for entry nodes).
    pub name: String,
    /// Alias downstream connections refer to.
    pub alias: String,
}

/// Descriptor of one node in a pipeline definition.
///
/// Plain data: library and model references are held by name and resolved
/// against the registry and model provider at validation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node variant.
    pub kind: NodeKind,
    /// Name, unique within the definition.
    pub name: String,
    /// Referenced model, for DL nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Requested model version; `None` selects the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u64>,
    /// Referenced custom-node library, for custom nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_name: Option<String>,
    /// String parameters handed to the custom-node library verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Output alias map (producer-local name → externally visible alias).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputMapping>,
    /// Demultiplex fan-out, if this node shards its outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demultiply: Option<DemultiplyCount>,
    /// Names of demultiplexers this node gathers, if any.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub gather_from: BTreeSet<String>,
}

impl NodeInfo {
    fn base(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            model_name: None,
            model_version: None,
            library_name: None,
            parameters: BTreeMap::new(),
            outputs: Vec::new(),
            demultiply: None,
            gather_from: BTreeSet::new(),
        }
    }

    /// Create an entry node exposing the given request inputs.
    pub fn entry(name: impl Into<String>, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut info = Self::base(NodeKind::Entry, name);
        info.outputs = inputs
            .into_iter()
            .map(|input| {
                let input = input.into();
                OutputMapping {
                    name: input.clone(),
                    alias: input,
                }
            })
            .collect();
        info
    }

    /// Create an exit node.
    pub fn exit(name: impl Into<String>) -> Self {
        Self::base(NodeKind::Exit, name)
    }

    /// Create a DL node referencing a model.
    pub fn dl(name: impl Into<String>, model: impl Into<String>) -> Self {
        let mut info = Self::base(NodeKind::Dl, name);
        info.model_name = Some(model.into());
        info
    }

    /// Create a custom node referencing a library.
    pub fn custom(name: impl Into<String>, library: impl Into<String>) -> Self {
        let mut info = Self::base(NodeKind::Custom, name);
        info.library_name = Some(library.into());
        info
    }

    /// Pin the DL node to a model version.
    #[must_use]
    pub fn with_model_version(mut self, version: u64) -> Self {
        self.model_version = Some(version);
        self
    }

    /// Add a library parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Map a producer-local output name to an alias.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.outputs.push(OutputMapping {
            name: name.into(),
            alias: alias.into(),
        });
        self
    }

    /// Declare a static demultiplex fan-out.
    #[must_use]
    pub fn with_demultiply(mut self, count: u32) -> Self {
        self.demultiply = Some(DemultiplyCount::Static(count));
        self
    }

    /// Declare a dynamic demultiplex fan-out.
    #[must_use]
    pub fn with_dynamic_demultiply(mut self) -> Self {
        self.demultiply = Some(DemultiplyCount::Dynamic);
        self
    }

    /// Declare this node as the gather of a demultiplexer.
    #[must_use]
    pub fn with_gather_from(mut self, demultiplexer: impl Into<String>) -> Self {
        self.gather_from.insert(demultiplexer.into());
        self
    }

    /// Check whether this node shards its outputs.
    #[must_use]
    pub fn is_demultiplexer(&self) -> bool {
        self.demultiply.is_some()
    }

    /// Check whether this node gathers shard outputs.
    #[must_use]
    pub fn is_gather(&self) -> bool {
        !self.gather_from.is_empty()
    }

    /// Look up the producer-local name behind an alias.
    #[must_use]
    pub fn output_name_for_alias(&self, alias: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|mapping| mapping.alias == alias)
            .map(|mapping| mapping.name.as_str())
    }

    /// Check whether this node exposes an alias.
    #[must_use]
    pub fn has_output_alias(&self, alias: &str) -> bool {
        self.outputs.iter().any(|mapping| mapping.alias == alias)
    }

    /// Library parameters as ordered key/value pairs.
    #[must_use]
    pub fn parameter_pairs(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_exposes_inputs_as_aliases() {
        let entry = NodeInfo::entry("request", ["image", "factors"]);
        assert_eq!(entry.kind, NodeKind::Entry);
        assert!(entry.has_output_alias("image"));
        assert!(entry.has_output_alias("factors"));
        assert_eq!(entry.output_name_for_alias("image"), Some("image"));
    }

    #[test]
    fn custom_builder() {
        let node = NodeInfo::custom("ops", "different_ops")
            .with_parameter("add_value", "2.5")
            .with_output("different_ops_results", "results")
            .with_demultiply(4);

        assert_eq!(node.kind, NodeKind::Custom);
        assert_eq!(node.library_name.as_deref(), Some("different_ops"));
        assert!(node.is_demultiplexer());
        assert!(!node.is_gather());
        assert_eq!(node.output_name_for_alias("results"), Some("different_ops_results"));
        assert_eq!(
            node.parameter_pairs(),
            vec![("add_value".to_string(), "2.5".to_string())]
        );
    }

    #[test]
    fn gather_declaration() {
        let node = NodeInfo::custom("pick_max", "choose_maximum").with_gather_from("ops");
        assert!(node.is_gather());
        assert!(node.gather_from.contains("ops"));
    }

    #[test]
    fn dl_version_pinning() {
        let node = NodeInfo::dl("infer", "dummy").with_model_version(3);
        assert_eq!(node.model_name.as_deref(), Some("dummy"));
        assert_eq!(node.model_version, Some(3));
    }
}
