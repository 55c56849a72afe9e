//! Failure taxonomy shared by the compilation pipeline and the expansion layer.

use thiserror::Error;

/// Fatal failures surfaced by compilation or distributed expansion.
///
/// There are no retries anywhere in the pipeline: every variant aborts the
/// current attempt wholesale and partial graphs are never returned.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler's inputs were malformed before any tracing began.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The traced step body returned something other than a flat sequence of
    /// tensors. Downstream tracing does not attempt structural recovery of
    /// outputs, so this is rejected at trace time.
    #[error("train step output must be a flat sequence of tensors")]
    OutputShape,

    /// A flat sequence disagreed with its reconstruction descriptor. This is
    /// an internal invariant violation, not a recoverable condition.
    #[error("structure mismatch: descriptor expects {expected} leaves, got {got}")]
    StructureMismatch { expected: usize, got: usize },

    /// An optimizer state leaf survived warm-up holding non-zero real data,
    /// so the zero-initialization contract the warm-up pass relies on does
    /// not hold for this optimizer.
    #[error("optimizer state leaf '{name}' is not zero-initialized")]
    UnsupportedOptimizerState { name: String },

    /// The distributed converter could not realize a requested placement
    /// schema for some value. Partial conversion is disallowed by policy.
    #[error("placement conversion failed: {0}")]
    PlacementConversion(String),

    /// An optional capability that this strategy does not provide.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// A failure raised while evaluating the step body or a graph.
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

/// Convenience alias used throughout the pipeline.
pub type CompileResult<T> = Result<T, CompileError>;
