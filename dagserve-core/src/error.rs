//! Status codes for the pipeline execution engine.
//!
//! Every fallible operation in the engine reports a [`PipelineError`]. Each
//! variant carries the identifiers needed to act on it (pipeline name, node
//! name, library path) and maps to a stable wire status code via
//! [`PipelineError::code`], so the RPC surface can translate errors without
//! string matching.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    // =========================================================================
    // Definition registry and lifecycle
    // =========================================================================
    /// A definition with this name is already registered.
    #[error("PIPELINE_DEFINITION_ALREADY_EXIST: pipeline definition '{pipeline}' is already created")]
    DefinitionAlreadyExists {
        /// The pipeline name.
        pipeline: String,
    },

    /// No definition with this name exists.
    #[error("PIPELINE_DEFINITION_NAME_MISSING: pipeline with requested name '{pipeline}' does not exist")]
    DefinitionNameMissing {
        /// The pipeline name.
        pipeline: String,
    },

    /// The definition exists but has not reached the loaded state.
    #[error("PIPELINE_DEFINITION_NOT_LOADED_YET: pipeline definition '{pipeline}' is not loaded yet")]
    DefinitionNotLoadedYet {
        /// The pipeline name.
        pipeline: String,
    },

    /// The definition has been retired and no longer accepts requests.
    #[error("PIPELINE_DEFINITION_NOT_LOADED_ANYMORE: pipeline definition '{pipeline}' is retired")]
    DefinitionNotLoadedAnymore {
        /// The pipeline name.
        pipeline: String,
    },

    // =========================================================================
    // Definition validation
    // =========================================================================
    /// Two nodes in one definition share a name.
    #[error("PIPELINE_NODE_NAME_DUPLICATE: pipeline '{pipeline}' declares node '{node}' more than once")]
    NodeNameDuplicate {
        /// The pipeline name.
        pipeline: String,
        /// The duplicated node name.
        node: String,
    },

    /// More than one entry node declared.
    #[error("PIPELINE_MULTIPLE_ENTRY_NODES: pipeline '{pipeline}' declares more than one entry node")]
    MultipleEntryNodes {
        /// The pipeline name.
        pipeline: String,
    },

    /// More than one exit node declared.
    #[error("PIPELINE_MULTIPLE_EXIT_NODES: pipeline '{pipeline}' declares more than one exit node")]
    MultipleExitNodes {
        /// The pipeline name.
        pipeline: String,
    },

    /// Entry or exit node missing.
    #[error("PIPELINE_MISSING_ENTRY_OR_EXIT: pipeline '{pipeline}' must declare exactly one entry and one exit node")]
    MissingEntryOrExit {
        /// The pipeline name.
        pipeline: String,
    },

    /// A connection references a missing node or alias, binds an input
    /// twice, or leaves an input unbound.
    #[error("PIPELINE_CONNECTION_INVALID: pipeline '{pipeline}', node '{node}': {cause}")]
    ConnectionInvalid {
        /// The pipeline name.
        pipeline: String,
        /// The destination node of the offending connection.
        node: String,
        /// Description of the defect.
        cause: String,
    },

    /// The node graph contains a cycle.
    #[error("PIPELINE_CYCLE_FOUND: pipeline '{pipeline}' contains a cycle involving nodes {nodes:?}")]
    CycleFound {
        /// The pipeline name.
        pipeline: String,
        /// Nodes that could not be topologically ordered.
        nodes: Vec<String>,
    },

    /// A demultiplexer has no gather node declaring it.
    #[error("PIPELINE_DEMULTIPLEXER_WITHOUT_GATHER: pipeline '{pipeline}': no gather node declares demultiplexer '{node}'")]
    DemultiplexerWithoutGather {
        /// The pipeline name.
        pipeline: String,
        /// The unmatched demultiplexer.
        node: String,
    },

    /// A gather node references a node that is not an upstream demultiplexer.
    #[error("PIPELINE_GATHER_WITHOUT_DEMULTIPLEXER: pipeline '{pipeline}': node '{node}' gathers from '{from}' which is not an upstream demultiplexer")]
    GatherWithoutDemultiplexer {
        /// The pipeline name.
        pipeline: String,
        /// The gather node.
        node: String,
        /// The name it tried to gather from.
        from: String,
    },

    /// Shard levels are inconsistent across a node's inbound edges, or an
    /// edge leaves a demultiplexed region without passing through its gather.
    #[error("PIPELINE_DEMULTIPLEX_LEVELS_MISMATCH: pipeline '{pipeline}', node '{node}': {cause}")]
    DemultiplexLevelsMismatch {
        /// The pipeline name.
        pipeline: String,
        /// The node with inconsistent levels.
        node: String,
        /// Description of the mismatch.
        cause: String,
    },

    // =========================================================================
    // Custom-node libraries
    // =========================================================================
    /// The shared object does not export the full required symbol set.
    #[error("NODE_LIBRARY_MISSING_SYMBOLS: library at {path} does not resolve symbol '{symbol}'")]
    LibraryMissingSymbols {
        /// Path of the shared object.
        path: PathBuf,
        /// The first symbol that failed to resolve.
        symbol: String,
    },

    /// The library path is outside the allowed root, contains `..`, or is
    /// not a regular file.
    #[error("NODE_LIBRARY_INVALID_PATH: {path}: {cause}")]
    LibraryInvalidPath {
        /// The rejected path.
        path: PathBuf,
        /// Why it was rejected.
        cause: String,
    },

    /// The dynamic loader refused the shared object.
    #[error("NODE_LIBRARY_LOAD_FAILED: failed to load library at {path}: {cause}")]
    LibraryLoadFailed {
        /// Path of the shared object.
        path: PathBuf,
        /// Loader error message.
        cause: String,
    },

    /// A node references a library name absent from the registry.
    #[error("NODE_LIBRARY_NAME_MISSING: library '{library}' is not registered")]
    LibraryNameMissing {
        /// The missing library name.
        library: String,
    },

    /// A library with this name is already registered.
    #[error("NODE_LIBRARY_ALREADY_EXISTS: library '{library}' is already registered")]
    LibraryAlreadyExists {
        /// The duplicated library name.
        library: String,
    },

    /// The library's `execute` returned a non-zero status.
    #[error("NODE_LIBRARY_EXECUTION_FAILED: node '{node}' execute returned status {status}")]
    LibraryExecutionFailed {
        /// The custom node.
        node: String,
        /// The non-zero status the library returned.
        status: i32,
    },

    /// The library reported outputs but handed back a null or unreadable
    /// output array.
    #[error("NODE_LIBRARY_OUTPUTS_CORRUPTED: node '{node}' produced a corrupted output array")]
    LibraryOutputsCorrupted {
        /// The custom node.
        node: String,
    },

    /// Produced output count disagrees with the count declared by
    /// `getOutputsInfo`.
    #[error("NODE_LIBRARY_OUTPUTS_CORRUPTED_COUNT: node '{node}' produced {produced} outputs, library declares {declared}")]
    LibraryOutputsCorruptedCount {
        /// The custom node.
        node: String,
        /// Count declared by the library metadata.
        declared: usize,
        /// Count actually produced.
        produced: usize,
    },

    /// An alias required by downstream edges is absent from the outputs.
    #[error("NODE_LIBRARY_MISSING_OUTPUT: node '{node}' did not produce required output '{output}'")]
    LibraryMissingOutput {
        /// The custom node.
        node: String,
        /// The missing output alias.
        output: String,
    },

    /// An output carries an unrecognized precision tag.
    #[error("NODE_LIBRARY_INVALID_PRECISION: node '{node}' output '{output}' has unrecognized precision")]
    LibraryInvalidPrecision {
        /// The custom node.
        node: String,
        /// The offending output.
        output: String,
    },

    /// An output shape is empty or contains a dimension below one.
    #[error("NODE_LIBRARY_INVALID_SHAPE: node '{node}' output '{output}' has an invalid shape")]
    LibraryInvalidShape {
        /// The custom node.
        node: String,
        /// The offending output.
        output: String,
    },

    /// Output byte length disagrees with shape and precision.
    #[error("NODE_LIBRARY_INVALID_CONTENT_SIZE: node '{node}' output '{output}': expected {expected} bytes, got {actual}")]
    LibraryInvalidContentSize {
        /// The custom node.
        node: String,
        /// The offending output.
        output: String,
        /// Byte length implied by shape and precision.
        expected: usize,
        /// Byte length actually produced.
        actual: usize,
    },

    /// Connected input aliases disagree with the library's declared inputs.
    #[error("NODE_LIBRARY_INPUTS_MISMATCH: node '{node}': {cause}")]
    LibraryInputsMismatch {
        /// The custom node.
        node: String,
        /// Description of the disagreement.
        cause: String,
    },

    // =========================================================================
    // Models
    // =========================================================================
    /// The referenced model does not exist.
    #[error("MODEL_MISSING: model '{model}' is not available")]
    ModelMissing {
        /// The model name.
        model: String,
    },

    /// The referenced model version does not exist.
    #[error("MODEL_VERSION_MISSING: model '{model}' version {version} is not available")]
    ModelVersionMissing {
        /// The model name.
        model: String,
        /// The requested version.
        version: u64,
    },

    /// Inference results lack an output the descriptor maps.
    #[error("MODEL_MISSING_OUTPUT: model '{model}' did not produce output '{output}'")]
    ModelMissingOutput {
        /// The model name.
        model: String,
        /// The missing output name.
        output: String,
    },

    /// Inference itself failed.
    #[error("INFERENCE_FAILED: model '{model}': {cause}")]
    InferenceFailed {
        /// The model name.
        model: String,
        /// Engine error message.
        cause: String,
    },

    // =========================================================================
    // Pipeline runtime
    // =========================================================================
    /// A demultiplexer would push the total shard count over the configured
    /// bound.
    #[error("DEMULTIPLEXER_LIMIT_EXCEEDED: request would create {requested} shards, limit is {limit}")]
    DemultiplexerLimitExceeded {
        /// Shards the request would create.
        requested: u64,
        /// The configured bound.
        limit: u64,
    },

    /// A static demultiply count disagrees with the produced first dimension.
    #[error("DEMULTIPLY_COUNT_MISMATCH: node '{node}' declares demultiply count {expected}, produced first dimension {actual}")]
    DemultiplyCountMismatch {
        /// The demultiplexer node.
        node: String,
        /// The declared count.
        expected: u64,
        /// The produced leading dimension.
        actual: u64,
    },

    /// Shard tensors collected at a gather disagree in shape or precision.
    #[error("GATHER_SHAPE_MISMATCH: node '{node}': {cause}")]
    GatherShapeMismatch {
        /// The gather node.
        node: String,
        /// Description of the disagreement.
        cause: String,
    },

    /// The pipeline deadline elapsed before the node could finish.
    #[error("DEADLINE_EXCEEDED: node '{node}' exceeded the remaining pipeline deadline")]
    DeadlineExceeded {
        /// The node that ran out of budget.
        node: String,
    },

    /// The request is missing a declared pipeline input.
    #[error("REQUEST_MISSING_INPUT: request does not carry declared input '{input}'")]
    RequestMissingInput {
        /// The declared input name.
        input: String,
    },

    /// A tensor violates its own shape/precision/byte-length invariant.
    #[error("INVALID_TENSOR: {cause}")]
    InvalidTensor {
        /// Description of the violation.
        cause: String,
    },

    // =========================================================================
    // Stateful sequences
    // =========================================================================
    /// A sequence with this id already exists.
    #[error("SEQUENCE_ALREADY_EXISTS: sequence {sequence} already exists")]
    SequenceAlreadyExists {
        /// The sequence id.
        sequence: u64,
    },

    /// No sequence with this id exists.
    #[error("SEQUENCE_MISSING: sequence {sequence} does not exist")]
    SequenceMissing {
        /// The sequence id.
        sequence: u64,
    },

    /// The sequence was already terminated.
    #[error("SEQUENCE_TERMINATED: sequence {sequence} is terminated")]
    SequenceTerminated {
        /// The sequence id.
        sequence: u64,
    },

    /// The manager holds its configured maximum number of sequences.
    #[error("SEQUENCE_LIMIT_EXCEEDED: sequence count reached the configured maximum of {limit}")]
    SequenceLimitExceeded {
        /// The configured maximum.
        limit: u32,
    },

    /// Anything without a more precise code.
    #[error("UNKNOWN_ERROR: {cause}")]
    Unknown {
        /// Description of the failure.
        cause: String,
    },
}

impl PipelineError {
    /// Get the stable wire status code (e.g. `"PIPELINE_CYCLE_FOUND"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DefinitionAlreadyExists { .. } => "PIPELINE_DEFINITION_ALREADY_EXIST",
            Self::DefinitionNameMissing { .. } => "PIPELINE_DEFINITION_NAME_MISSING",
            Self::DefinitionNotLoadedYet { .. } => "PIPELINE_DEFINITION_NOT_LOADED_YET",
            Self::DefinitionNotLoadedAnymore { .. } => "PIPELINE_DEFINITION_NOT_LOADED_ANYMORE",
            Self::NodeNameDuplicate { .. } => "PIPELINE_NODE_NAME_DUPLICATE",
            Self::MultipleEntryNodes { .. } => "PIPELINE_MULTIPLE_ENTRY_NODES",
            Self::MultipleExitNodes { .. } => "PIPELINE_MULTIPLE_EXIT_NODES",
            Self::MissingEntryOrExit { .. } => "PIPELINE_MISSING_ENTRY_OR_EXIT",
            Self::ConnectionInvalid { .. } => "PIPELINE_CONNECTION_INVALID",
            Self::CycleFound { .. } => "PIPELINE_CYCLE_FOUND",
            Self::DemultiplexerWithoutGather { .. } => "PIPELINE_DEMULTIPLEXER_WITHOUT_GATHER",
            Self::GatherWithoutDemultiplexer { .. } => "PIPELINE_GATHER_WITHOUT_DEMULTIPLEXER",
            Self::DemultiplexLevelsMismatch { .. } => "PIPELINE_DEMULTIPLEX_LEVELS_MISMATCH",
            Self::LibraryMissingSymbols { .. } => "NODE_LIBRARY_MISSING_SYMBOLS",
            Self::LibraryInvalidPath { .. } => "NODE_LIBRARY_INVALID_PATH",
            Self::LibraryLoadFailed { .. } => "NODE_LIBRARY_LOAD_FAILED",
            Self::LibraryNameMissing { .. } => "NODE_LIBRARY_NAME_MISSING",
            Self::LibraryAlreadyExists { .. } => "NODE_LIBRARY_ALREADY_EXISTS",
            Self::LibraryExecutionFailed { .. } => "NODE_LIBRARY_EXECUTION_FAILED",
            Self::LibraryOutputsCorrupted { .. } => "NODE_LIBRARY_OUTPUTS_CORRUPTED",
            Self::LibraryOutputsCorruptedCount { .. } => "NODE_LIBRARY_OUTPUTS_CORRUPTED_COUNT",
            Self::LibraryMissingOutput { .. } => "NODE_LIBRARY_MISSING_OUTPUT",
            Self::LibraryInvalidPrecision { .. } => "NODE_LIBRARY_INVALID_PRECISION",
            Self::LibraryInvalidShape { .. } => "NODE_LIBRARY_INVALID_SHAPE",
            Self::LibraryInvalidContentSize { .. } => "NODE_LIBRARY_INVALID_CONTENT_SIZE",
            Self::LibraryInputsMismatch { .. } => "NODE_LIBRARY_INPUTS_MISMATCH",
            Self::ModelMissing { .. } => "MODEL_MISSING",
            Self::ModelVersionMissing { .. } => "MODEL_VERSION_MISSING",
            Self::ModelMissingOutput { .. } => "MODEL_MISSING_OUTPUT",
            Self::InferenceFailed { .. } => "INFERENCE_FAILED",
            Self::DemultiplexerLimitExceeded { .. } => "DEMULTIPLEXER_LIMIT_EXCEEDED",
            Self::DemultiplyCountMismatch { .. } => "DEMULTIPLY_COUNT_MISMATCH",
            Self::GatherShapeMismatch { .. } => "GATHER_SHAPE_MISMATCH",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::RequestMissingInput { .. } => "REQUEST_MISSING_INPUT",
            Self::InvalidTensor { .. } => "INVALID_TENSOR",
            Self::SequenceAlreadyExists { .. } => "SEQUENCE_ALREADY_EXISTS",
            Self::SequenceMissing { .. } => "SEQUENCE_MISSING",
            Self::SequenceTerminated { .. } => "SEQUENCE_TERMINATED",
            Self::SequenceLimitExceeded { .. } => "SEQUENCE_LIMIT_EXCEEDED",
            Self::Unknown { .. } => "UNKNOWN_ERROR",
        }
    }

    /// Check if this error blocks a definition from reaching the loaded
    /// state (load-time taxonomy).
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::NodeNameDuplicate { .. }
                | Self::MultipleEntryNodes { .. }
                | Self::MultipleExitNodes { .. }
                | Self::MissingEntryOrExit { .. }
                | Self::ConnectionInvalid { .. }
                | Self::CycleFound { .. }
                | Self::DemultiplexerWithoutGather { .. }
                | Self::GatherWithoutDemultiplexer { .. }
                | Self::DemultiplexLevelsMismatch { .. }
                | Self::LibraryNameMissing { .. }
                | Self::LibraryInputsMismatch { .. }
                | Self::ModelMissing { .. }
                | Self::ModelVersionMissing { .. }
        )
    }

    /// Check if this error aborts a single pipeline execution rather than a
    /// definition (runtime taxonomy).
    #[must_use]
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            Self::LibraryExecutionFailed { .. }
                | Self::LibraryOutputsCorrupted { .. }
                | Self::LibraryOutputsCorruptedCount { .. }
                | Self::LibraryMissingOutput { .. }
                | Self::LibraryInvalidPrecision { .. }
                | Self::LibraryInvalidShape { .. }
                | Self::LibraryInvalidContentSize { .. }
                | Self::InferenceFailed { .. }
                | Self::ModelMissingOutput { .. }
                | Self::DemultiplexerLimitExceeded { .. }
                | Self::DemultiplyCountMismatch { .. }
                | Self::GatherShapeMismatch { .. }
                | Self::DeadlineExceeded { .. }
                | Self::RequestMissingInput { .. }
                | Self::InvalidTensor { .. }
        )
    }
}

/// Result type alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        let err = PipelineError::DefinitionAlreadyExists {
            pipeline: "ensemble".to_string(),
        };
        assert_eq!(err.code(), "PIPELINE_DEFINITION_ALREADY_EXIST");

        let err = PipelineError::LibraryMissingOutput {
            node: "custom_node".to_string(),
            output: "maximum_tensor".to_string(),
        };
        assert_eq!(err.code(), "NODE_LIBRARY_MISSING_OUTPUT");
    }

    #[test]
    fn display_carries_code_and_context() {
        let err = PipelineError::DemultiplexerLimitExceeded {
            requested: 1 << 20,
            limit: 10_000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("DEMULTIPLEXER_LIMIT_EXCEEDED"));
        assert!(msg.contains("10000"));
    }

    #[test]
    fn taxonomy_predicates() {
        assert!(
            PipelineError::CycleFound {
                pipeline: "p".to_string(),
                nodes: vec!["a".to_string()]
            }
            .is_validation_error()
        );
        assert!(
            !PipelineError::DeadlineExceeded {
                node: "n".to_string()
            }
            .is_validation_error()
        );
        assert!(
            PipelineError::DeadlineExceeded {
                node: "n".to_string()
            }
            .is_execution_error()
        );
    }
}
