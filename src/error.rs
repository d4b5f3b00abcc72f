//! Error types for marrow.
//!
//! This module defines all error types used throughout the library.
//!
//! Malformed inputs (mismatched vertex counts, out-of-range topology
//! indices, non-monotonic frame partitions) are precondition violations
//! and surface as errors before any computation runs. Numeric
//! degeneracies inside the solver (zero-weight rigid fits, near-zero
//! weight sums) are not errors; they are absorbed locally with
//! well-defined fallbacks.

use thiserror::Error;

/// Result type alias using [`SolveError`].
pub type Result<T> = std::result::Result<T, SolveError>;

/// Errors that can occur while building solver inputs or solving.
#[derive(Error, Debug)]
pub enum SolveError {
    /// The mesh has no vertices.
    #[error("mesh has no vertices")]
    EmptyMesh,

    /// A polygon references an invalid vertex index.
    #[error("polygon {polygon} references invalid vertex index {vertex}")]
    InvalidVertexIndex {
        /// The polygon index.
        polygon: usize,
        /// The invalid vertex index.
        vertex: usize,
    },

    /// Rest geometry and animated frames disagree on the vertex count.
    #[error("vertex count mismatch: rest geometry has {rest}, animation has {animated}")]
    VertexCountMismatch {
        /// Vertex count of the rest geometry.
        rest: usize,
        /// Vertex count of the animated frames.
        animated: usize,
    },

    /// A position matrix does not stack 3-row coordinate blocks.
    #[error("{name} has {rows} rows, which is not a multiple of 3")]
    MalformedPositions {
        /// Which matrix is malformed.
        name: &'static str,
        /// The offending row count.
        rows: usize,
    },

    /// The per-subject frame partition is not monotonically non-decreasing
    /// or does not end at the total frame count.
    #[error("frame partition is invalid at subject {subject}: {start} > {end}")]
    NonMonotonicFrames {
        /// The subject whose range is inverted.
        subject: usize,
        /// Claimed first frame of the subject.
        start: usize,
        /// Claimed one-past-last frame of the subject.
        end: usize,
    },

    /// A warm-start or lock array has the wrong dimensions.
    #[error("dimension mismatch for {name}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being supplied.
        name: &'static str,
        /// The expected size.
        expected: usize,
        /// The supplied size.
        actual: usize,
    },

    /// An iterative linear solve failed to converge.
    #[error("linear solver failed to converge after {iterations} iterations")]
    ConvergenceFailed {
        /// Number of iterations attempted.
        iterations: usize,
    },

    /// Invalid parameter value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },
}

impl SolveError {
    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: &'static str,
        value: T,
        reason: &'static str,
    ) -> Self {
        SolveError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }
}
