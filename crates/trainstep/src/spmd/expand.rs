//! The fallback expansion strategy: replicate parameters and optimizer
//! state on every device, shard runtime inputs along their leading
//! dimension. This reproduces data-parallel behavior without any
//! model-specific placement knowledge.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::CompileResult;
use crate::flatten::{flatten, named_tree, states_tree, NamedCells, NamedStates};
use crate::graph::Graph;
use crate::tensor::{CellId, TensorCell, TensorSpec};

use super::convert::convert_to_distributed;
use super::grid::DeviceGrid;
use super::placement::{Placement, Schema};
use super::{GraphPass, ParallelMode, StepArg};

pub struct FallbackExpansion {
    world_size: usize,
    placements_override: HashMap<CellId, Vec<Placement>>,
    optimization_passes: Vec<GraphPass>,
}

impl FallbackExpansion {
    /// A strategy expanding onto a grid of `world_size` devices.
    pub fn new(world_size: usize) -> Self {
        FallbackExpansion {
            world_size,
            placements_override: HashMap::new(),
            optimization_passes: Vec::new(),
        }
    }

    /// Overrides the default shard-on-dim-0 placement for one runtime
    /// argument, keyed by the argument cell's identity.
    pub fn override_placement(&mut self, arg: &TensorCell, placements: Vec<Placement>) {
        self.placements_override.insert(arg.id(), placements);
    }
}

impl ParallelMode for FallbackExpansion {
    fn expand(
        &self,
        graph: Graph,
        params_and_buffers: &NamedCells,
        named_states: &NamedStates,
        args: &[StepArg],
        kwargs: &[(String, StepArg)],
    ) -> CompileResult<Graph> {
        let grid = Arc::new(DeviceGrid::new(self.world_size));
        let shard_schema = Schema::shard(Arc::clone(&grid), 0);
        let replicate_schema = Schema::replicate(Arc::clone(&grid));

        let mut inps: Vec<TensorSpec> = Vec::new();
        let mut schemas: Vec<Schema> = Vec::new();

        // Parameters, buffers, and optimizer state: full copy on every
        // device.
        for cell in flatten(&named_tree(params_and_buffers)).0 {
            inps.push(cell.spec());
            schemas.push(replicate_schema.clone());
        }
        for cell in flatten(&states_tree(named_states)).0 {
            inps.push(cell.spec());
            schemas.push(replicate_schema.clone());
        }

        // Runtime arguments: shard on the leading dimension unless an
        // override is registered for this argument's identity. Non-tensor
        // arguments become empty placeholders so positions stay aligned;
        // they are guaranteed unused downstream but must occupy a slot.
        for arg in args.iter().chain(kwargs.iter().map(|(_, arg)| arg)) {
            match arg {
                StepArg::Tensor(cell) => {
                    inps.push(cell.spec());
                    match self.placements_override.get(&cell.id()) {
                        Some(placements) => schemas
                            .push(Schema::new(Arc::clone(&grid), placements.clone())),
                        None => schemas.push(shard_schema.clone()),
                    }
                }
                StepArg::Opaque => {
                    inps.push(TensorSpec::empty_placeholder());
                    schemas.push(shard_schema.clone());
                }
            }
        }

        debug!(
            world_size = self.world_size,
            values = inps.len(),
            "expanding with fallback placement"
        );
        convert_to_distributed(graph, &inps, &schemas, false)
    }

    /// Folds the configured passes over the graph, in configuration order.
    fn optimize(&self, graph: Graph) -> CompileResult<Graph> {
        if self.optimization_passes.is_empty() {
            return Err(crate::error::CompileError::Unimplemented("optimize"));
        }
        self.optimization_passes
            .iter()
            .try_fold(graph, |graph, pass| pass(graph))
    }

    fn configure_optimization_passes(&mut self, passes: Vec<GraphPass>) -> CompileResult<()> {
        self.optimization_passes = passes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CompileError;
    use crate::graph::Session;
    use crate::spmd::ParallelMode;
    use crate::tensor::{HostTensor, Shape, TensorCell, TensorSpec};

    use super::*;

    fn tiny_graph() -> Graph {
        let mut session = Session::trace();
        let x = session.input(TensorSpec::f32(Shape::new([2]))).unwrap();
        let out = session.neg(&x).unwrap();
        session.finish(&[out]).unwrap()
    }

    #[test]
    fn optimize_without_configured_passes_is_unimplemented() {
        let strategy = FallbackExpansion::new(2);
        assert!(matches!(
            strategy.optimize(tiny_graph()),
            Err(CompileError::Unimplemented("optimize"))
        ));
    }

    #[test]
    fn optimize_runs_configured_passes() {
        let mut strategy = FallbackExpansion::new(2);
        strategy
            .configure_optimization_passes(vec![crate::passes::functionalize])
            .unwrap();
        let graph = strategy.optimize(tiny_graph()).unwrap();
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn opaque_arguments_keep_their_slot() {
        let mut session = Session::trace();
        let x_spec = TensorSpec::f32(Shape::new([4, 2]));
        let x = session.input(x_spec).unwrap();
        let unused = session.input(TensorSpec::empty_placeholder()).unwrap();
        let _ = unused;
        let out = session.neg(&x).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let strategy = FallbackExpansion::new(2);
        let x_cell = TensorCell::real(HostTensor::zeros(TensorSpec::f32(Shape::new([4, 2]))));
        let dist = strategy
            .expand(
                graph,
                &Vec::new(),
                &Vec::new(),
                &[StepArg::Tensor(x_cell), StepArg::Opaque],
                &[],
            )
            .unwrap();

        let schemas = dist.input_schemas().unwrap();
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].placement(), Placement::Shard(0));
        assert_eq!(schemas[1].placement(), Placement::Shard(0));
    }
}
