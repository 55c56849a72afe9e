//! Distributed graph expansion.
//!
//! A single-device graph becomes an SPMD graph by assigning every input a
//! placement schema and rewriting the body with the redistribution each
//! operation needs. The produced graph runs identically on every device in
//! the grid; the embedded collective operations are executed by the external
//! communication runtime.

mod convert;
mod expand;
mod grid;
mod placement;

pub use convert::convert_to_distributed;
pub use expand::FallbackExpansion;
pub use grid::{DeviceGrid, DeviceId};
pub use placement::{Placement, Schema};

use crate::error::{CompileError, CompileResult};
use crate::flatten::{NamedCells, NamedStates};
use crate::graph::Graph;
use crate::tensor::TensorCell;

/// A runtime argument as seen by the expansion layer. Non-tensor arguments
/// still occupy an input slot so tensor inputs line up with their
/// placeholders; they are replaced by empty placeholder tensors downstream.
#[derive(Clone)]
pub enum StepArg {
    Tensor(TensorCell),
    Opaque,
}

/// A graph-to-graph optimization pass a parallel mode may run.
pub type GraphPass = fn(Graph) -> CompileResult<Graph>;

/// Capability interface over distributed expansion strategies.
///
/// `expand` is the required entry point. `optimize` and
/// `configure_optimization_passes` default to unimplemented and are filled
/// in by concrete strategies as needed. Strategies are selected by explicit
/// construction.
pub trait ParallelMode {
    /// Expands a single-device graph into a distributed graph.
    fn expand(
        &self,
        graph: Graph,
        params_and_buffers: &NamedCells,
        named_states: &NamedStates,
        args: &[StepArg],
        kwargs: &[(String, StepArg)],
    ) -> CompileResult<Graph>;

    /// Runs this mode's optimization passes over a distributed graph.
    fn optimize(&self, _graph: Graph) -> CompileResult<Graph> {
        Err(CompileError::Unimplemented("optimize"))
    }

    /// Configures the optimization passes `optimize` runs.
    fn configure_optimization_passes(&mut self, _passes: Vec<GraphPass>) -> CompileResult<()> {
        Err(CompileError::Unimplemented("configure_optimization_passes"))
    }
}
