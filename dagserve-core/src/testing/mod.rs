//! Deterministic in-process test doubles.
//!
//! Custom-node libraries compiled into the binary (no shared objects
//! involved) plus a static model provider. The libraries speak the real ABI
//! through [`crate::library::NodeLibrary::from_api`], allocate through a
//! shared live-allocation table, and hand every allocation back through
//! `release`, so ownership bugs in the engine surface as non-zero release
//! statuses and non-zero outstanding counters.

mod libraries;
mod models;

pub use libraries::{
    add_sub_library, choose_maximum_library, counting_library, counting_library_counters,
    different_ops_library, live_mock_allocations,
};
pub use models::{DummyModel, FailingModel, StaticModelProvider};
pub use libraries::faulty_library;
