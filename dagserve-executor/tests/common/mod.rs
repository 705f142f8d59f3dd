//! Shared fixtures for the executor integration suites.

#![allow(dead_code)]

use dagserve_core::graph::NodeInfo;
use dagserve_core::library::LibraryRegistry;
use dagserve_core::testing::{self, DummyModel, StaticModelProvider};
use dagserve_executor::{ExecutionConfig, PipelineFactory};
use std::sync::Arc;

/// A factory wired with every mock library and the `dummy` (+1) model.
pub fn standard_factory(config: ExecutionConfig) -> PipelineFactory {
    let provider = Arc::new(StaticModelProvider::new());
    provider.add_model("dummy", DummyModel::increment());

    let libraries = Arc::new(LibraryRegistry::new());
    libraries.register(testing::add_sub_library()).unwrap();
    libraries.register(testing::different_ops_library()).unwrap();
    libraries.register(testing::choose_maximum_library()).unwrap();
    libraries.register(testing::faulty_library()).unwrap();
    libraries.register(testing::counting_library()).unwrap();

    PipelineFactory::new(provider, libraries).with_config(config)
}

/// An add_sub node emitting under the `numbers` alias.
pub fn add_sub_node(name: &str, add: f32, sub: f32) -> NodeInfo {
    NodeInfo::custom(name, "add_sub")
        .with_parameter("add_value", add.to_string())
        .with_parameter("sub_value", sub.to_string())
        .with_output("output_numbers", "numbers")
}

/// Assert element-wise closeness within `tolerance`.
pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {:?} vs {:?}",
        actual,
        expected
    );
    for (index, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {}: {} differs from {} by more than {}",
            index,
            a,
            e,
            tolerance
        );
    }
}
