//! dagserve core library.
//!
//! Foundational types for the dagserve pipeline execution engine: the
//! tensor value and its precisions, the status-code error type, the
//! custom-node plugin ABI with its loader and registry, the pipeline graph
//! descriptors with structural validation, and the model-provider seam to
//! the underlying inference engine.
//!
//! The execution engine itself (definitions, factory, scheduler) lives in
//! the `dagserve-executor` crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod library;
pub mod precision;
pub mod provider;
pub mod tensor;
pub mod testing;

pub use error::{PipelineError, Result};
pub use graph::{AliasMapping, Connections, DemultiplyCount, NodeInfo, NodeKind, OutputMapping};
pub use library::{LibraryRegistry, NodeLibrary};
pub use precision::Precision;
pub use provider::{ModelAvailabilityObserver, ModelInstance, ModelProvider};
pub use tensor::{Tensor, TensorMap};
