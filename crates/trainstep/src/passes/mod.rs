//! Graph-to-graph rewrites applied between tracing and execution.

mod functionalize;

pub use functionalize::functionalize;
