//! Runtime node variants.
//!
//! One vertex of the executing graph. The variants live in a tagged enum
//! dispatched by `match`, which keeps the scheduling loop free of virtual
//! dispatch; each variant owns everything its execution needs (the bound
//! request, the model provider handle, the library handle), so a node can
//! be executed from a spawned task without borrowing the pipeline.

mod custom;
mod dl;
mod entry;
mod exit;

pub(crate) use custom::CustomNode;
pub(crate) use dl::DlNode;
pub(crate) use entry::EntryNode;
pub(crate) use exit::ExitNode;

use crate::request::Request;
use dagserve_core::error::Result;
use dagserve_core::graph::{NodeInfo, NodeKind};
use dagserve_core::library::NodeLibrary;
use dagserve_core::provider::ModelProvider;
use dagserve_core::tensor::TensorMap;
use std::sync::Arc;

/// One executable node of a pipeline instance.
pub(crate) enum RuntimeNode {
    /// Materializes request tensors.
    Entry(EntryNode),
    /// Collects response tensors.
    Exit(ExitNode),
    /// Runs a model through the provider.
    Dl(DlNode),
    /// Runs a custom-node library.
    Custom(CustomNode),
}

impl RuntimeNode {
    /// Build the runtime node for a descriptor.
    pub fn build(
        info: &NodeInfo,
        library: Option<Arc<NodeLibrary>>,
        required_aliases: Vec<String>,
        request: &Arc<Request>,
        provider: &Arc<dyn ModelProvider>,
    ) -> Self {
        match info.kind {
            NodeKind::Entry => Self::Entry(EntryNode::new(info, Arc::clone(request))),
            NodeKind::Exit => Self::Exit(ExitNode::new(info)),
            NodeKind::Dl => Self::Dl(DlNode::new(info, Arc::clone(provider))),
            NodeKind::Custom => Self::Custom(CustomNode::new(
                info,
                library.expect("validated custom node carries a library"),
                required_aliases,
            )),
        }
    }

    /// The node name.
    pub fn name(&self) -> &str {
        match self {
            Self::Entry(node) => node.name(),
            Self::Exit(node) => node.name(),
            Self::Dl(node) => node.name(),
            Self::Custom(node) => node.name(),
        }
    }

    /// Execute the node against its satisfied inputs, producing a mapping
    /// of output alias to tensor.
    pub async fn execute(&self, inputs: TensorMap) -> Result<TensorMap> {
        match self {
            Self::Entry(node) => node.execute(),
            Self::Exit(node) => Ok(node.execute(inputs)),
            Self::Dl(node) => node.execute(inputs).await,
            Self::Custom(node) => node.execute(inputs).await,
        }
    }
}
