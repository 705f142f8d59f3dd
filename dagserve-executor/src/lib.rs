//! dagserve execution engine.
//!
//! Turns validated pipeline definitions into per-request executions: the
//! [`factory::PipelineFactory`] registry, the
//! [`definition::PipelineDefinition`] lifecycle, and the
//! [`scheduler::Pipeline`] engine that schedules nodes by readiness,
//! fans demultiplexed shards out into tagged sub-executions and gathers
//! them back.
//!
//! ```no_run
//! use dagserve_core::graph::{Connections, NodeInfo};
//! use dagserve_core::library::LibraryRegistry;
//! use dagserve_core::tensor::Tensor;
//! use dagserve_core::testing::{DummyModel, StaticModelProvider};
//! use dagserve_executor::factory::PipelineFactory;
//! use dagserve_executor::request::Request;
//! use std::sync::Arc;
//!
//! # async fn serve() -> dagserve_core::error::Result<()> {
//! let provider = Arc::new(StaticModelProvider::new());
//! provider.add_model("dummy", DummyModel::increment());
//! let factory = PipelineFactory::new(provider, Arc::new(LibraryRegistry::new()));
//!
//! let nodes = vec![
//!     NodeInfo::entry("request", ["numbers"]),
//!     NodeInfo::dl("infer", "dummy").with_output("a", "incremented"),
//!     NodeInfo::exit("response"),
//! ];
//! let connections = Connections::new()
//!     .with("infer", "request", "numbers", "b")
//!     .with("response", "infer", "incremented", "result");
//! factory.create_definition("increment", nodes, connections)?;
//!
//! let request = Request::new()
//!     .with_input("numbers", Tensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0])?);
//! let response = factory.create("increment", request)?.execute().await?;
//! assert!(response.output("result").is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod definition;
pub mod factory;
mod nodes;
pub mod request;
pub mod scheduler;
pub mod sequence;

pub use config::ExecutionConfig;
pub use definition::{DefinitionState, PipelineDefinition};
pub use factory::PipelineFactory;
pub use request::{Request, Response};
pub use scheduler::Pipeline;
