//! Pipeline graph descriptors and their structural validation.

mod connection;
mod node_info;
mod validation;

pub use connection::{AliasMapping, Connections};
pub use node_info::{DemultiplyCount, NodeInfo, NodeKind, OutputMapping};
pub use validation::{GraphLayout, PipelineValidator};
