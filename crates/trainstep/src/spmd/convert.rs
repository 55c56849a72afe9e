//! The distributed-conversion procedure: deterministic placement
//! propagation with inserted redistribution, no cost-based search.

use std::collections::HashMap;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, Node, Op, ValueId};
use crate::tensor::TensorSpec;

use super::placement::{Placement, Schema};

struct Converter {
    out: Graph,
    world: usize,
    /// Original value -> (value in the converted graph, its placement).
    bindings: HashMap<ValueId, (ValueId, Placement)>,
}

fn conversion_err(message: impl std::fmt::Display) -> CompileError {
    CompileError::PlacementConversion(message.to_string())
}

impl Converter {
    fn local_spec_of(&self, value: ValueId) -> TensorSpec {
        self.out
            .spec_of(value)
            .expect("converted values always carry specs")
            .clone()
    }

    fn push(&mut self, op: Op, operands: SmallVec<[ValueId; 2]>) -> CompileResult<ValueId> {
        let specs: Vec<TensorSpec> = operands.iter().map(|v| self.local_spec_of(*v)).collect();
        let spec_refs: Vec<&TensorSpec> = specs.iter().collect();
        let spec = crate::graph::infer::output_spec(&op, &spec_refs).map_err(conversion_err)?;
        self.push_with_spec(op, operands, spec)
    }

    fn push_with_spec(
        &mut self,
        op: Op,
        operands: SmallVec<[ValueId; 2]>,
        spec: TensorSpec,
    ) -> CompileResult<ValueId> {
        let id = self.out.allocate_value();
        self.out.specs.insert(id, spec.clone());
        self.out.nodes.push(Node {
            id,
            op,
            inputs: operands,
            spec,
        });
        Ok(id)
    }

    /// Validates a schema against a value's global spec and returns the
    /// per-device local spec.
    fn local_input_spec(&self, spec: &TensorSpec, schema: &Schema) -> CompileResult<TensorSpec> {
        if schema.placements.len() != 1 {
            return Err(conversion_err(format!(
                "expected one placement per value on a 1-D grid, got {}",
                schema.placements.len()
            )));
        }
        match schema.placement() {
            Placement::Replicate => Ok(spec.clone()),
            Placement::Shard(dim) => {
                let shape = &spec.shape;
                if dim >= shape.rank() {
                    return Err(conversion_err(format!(
                        "cannot shard rank-{} value {} on dim {}",
                        shape.rank(),
                        spec,
                        dim
                    )));
                }
                if shape.dims()[dim] % self.world != 0 {
                    return Err(conversion_err(format!(
                        "dim {dim} of {spec} does not divide across {} devices",
                        self.world
                    )));
                }
                Ok(TensorSpec::new(
                    spec.dtype,
                    shape.with_dim_divided(dim, self.world),
                    spec.device,
                ))
            }
        }
    }

    fn resolve(&self, value: ValueId) -> CompileResult<(ValueId, Placement)> {
        self.bindings
            .get(&value)
            .copied()
            .ok_or_else(|| conversion_err(format!("value {value} has no placement binding")))
    }

    /// Inserts the collectives turning `from`'s placement into `target`.
    fn redistribute(
        &mut self,
        (value, placement): (ValueId, Placement),
        target: Placement,
    ) -> CompileResult<(ValueId, Placement)> {
        match (placement, target) {
            (a, b) if a == b => Ok((value, placement)),
            (Placement::Shard(dim), Placement::Replicate) => {
                let gathered = self.push(
                    Op::AllGather {
                        dim,
                        parts: self.world,
                    },
                    smallvec![value],
                )?;
                Ok((gathered, Placement::Replicate))
            }
            (Placement::Replicate, Placement::Shard(dim)) => {
                let split = self.push(
                    Op::SplitShard {
                        dim,
                        parts: self.world,
                    },
                    smallvec![value],
                )?;
                Ok((split, Placement::Shard(dim)))
            }
            (Placement::Shard(_), Placement::Shard(_)) => {
                let replicated = self.redistribute((value, placement), Placement::Replicate)?;
                self.redistribute(replicated, target)
            }
            _ => unreachable!("all placement pairs handled"),
        }
    }

    fn convert_node(&mut self, node: &Node) -> CompileResult<()> {
        let binding = match &node.op {
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let lhs = self.resolve(node.inputs[0])?;
                let rhs = self.resolve(node.inputs[1])?;
                let (lhs, rhs) = if lhs.1 == rhs.1 {
                    (lhs, rhs)
                } else {
                    (
                        self.redistribute(lhs, Placement::Replicate)?,
                        self.redistribute(rhs, Placement::Replicate)?,
                    )
                };
                let id = self.push(node.op.clone(), smallvec![lhs.0, rhs.0])?;
                (id, lhs.1)
            }
            Op::Neg | Op::AddScalar(_) | Op::MulScalar(_) => {
                let operand = self.resolve(node.inputs[0])?;
                let id = self.push(node.op.clone(), smallvec![operand.0])?;
                (id, operand.1)
            }
            Op::MatMul => {
                let lhs = self.resolve(node.inputs[0])?;
                let rhs = self.resolve(node.inputs[1])?;
                match (lhs.1, rhs.1) {
                    (Placement::Shard(0), Placement::Replicate) => {
                        let id = self.push(Op::MatMul, smallvec![lhs.0, rhs.0])?;
                        (id, Placement::Shard(0))
                    }
                    (Placement::Replicate, Placement::Replicate) => {
                        let id = self.push(Op::MatMul, smallvec![lhs.0, rhs.0])?;
                        (id, Placement::Replicate)
                    }
                    _ => {
                        let lhs = self.redistribute(lhs, Placement::Replicate)?;
                        let rhs = self.redistribute(rhs, Placement::Replicate)?;
                        let id = self.push(Op::MatMul, smallvec![lhs.0, rhs.0])?;
                        (id, Placement::Replicate)
                    }
                }
            }
            Op::Transpose => {
                let operand = self.resolve(node.inputs[0])?;
                let id = self.push(Op::Transpose, smallvec![operand.0])?;
                let placement = match operand.1 {
                    Placement::Shard(dim) => Placement::Shard(1 - dim),
                    Placement::Replicate => Placement::Replicate,
                };
                (id, placement)
            }
            Op::Sum | Op::Mean => {
                let operand = self.resolve(node.inputs[0])?;
                match operand.1 {
                    Placement::Replicate => {
                        let id = self.push(node.op.clone(), smallvec![operand.0])?;
                        (id, Placement::Replicate)
                    }
                    Placement::Shard(_) => {
                        // Local reduction followed by a cross-device sum.
                        // Equal shard sizes make the mean of local means the
                        // global mean, up to the 1/world correction.
                        let local = self.push(node.op.clone(), smallvec![operand.0])?;
                        let reduced = self.push(
                            Op::AllReduce { parts: self.world },
                            smallvec![local],
                        )?;
                        let id = if node.op == Op::Mean {
                            self.push(
                                Op::MulScalar(1.0 / self.world as f32),
                                smallvec![reduced],
                            )?
                        } else {
                            reduced
                        };
                        (id, Placement::Replicate)
                    }
                }
            }
            Op::Zeros => {
                let id =
                    self.push_with_spec(Op::Zeros, SmallVec::new(), node.spec.clone())?;
                (id, Placement::Replicate)
            }
            Op::CopyInto => {
                let dest = node.inputs[0];
                if !self.out.inputs.contains(&dest) {
                    return Err(conversion_err(format!(
                        "copy-back destination {dest} is not a graph input"
                    )));
                }
                let dest_binding = self.resolve(dest)?;
                let src = self.resolve(node.inputs[1])?;
                let src = self.redistribute(src, dest_binding.1)?;
                let id = self.push(Op::CopyInto, smallvec![dest_binding.0, src.0])?;
                (id, dest_binding.1)
            }
            op if op.is_mutation() => {
                return Err(conversion_err(
                    "graph must be functionalized before distributed expansion",
                ));
            }
            op if op.is_collective() => {
                return Err(conversion_err("graph is already distributed"));
            }
            op => {
                return Err(conversion_err(format!(
                    "no placement rule for {:?}",
                    op
                )));
            }
        };
        self.bindings.insert(node.id, binding);
        Ok(())
    }
}

/// Rewrites `graph` for SPMD execution under the given per-input schemas.
///
/// `inputs` carries the global spec of each graph input, position for
/// position; the count must match the graph exactly. Partial conversion is
/// disallowed by policy: any value that cannot be placed under its schema
/// fails the whole expansion.
pub fn convert_to_distributed(
    graph: Graph,
    inputs: &[TensorSpec],
    schemas: &[Schema],
    allow_partial: bool,
) -> CompileResult<Graph> {
    if allow_partial {
        return Err(CompileError::Unimplemented("partial placement conversion"));
    }
    if inputs.len() != graph.input_count() || schemas.len() != graph.input_count() {
        return Err(conversion_err(format!(
            "graph has {} inputs but {} specs and {} schemas were supplied",
            graph.input_count(),
            inputs.len(),
            schemas.len()
        )));
    }
    let Some(world) = schemas.first().map(|s| s.grid.world_size()) else {
        return Err(conversion_err("cannot expand a graph with no inputs"));
    };
    if schemas.iter().any(|s| s.grid.world_size() != world) {
        return Err(conversion_err("all schemas must address one device grid"));
    }
    if world == 0 {
        return Err(conversion_err("device grid is empty"));
    }

    let mut converter = Converter {
        out: Graph {
            inputs: graph.inputs.clone(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            specs: HashMap::new(),
            next_value: graph.next_value,
            input_schemas: Some(schemas.to_vec()),
        },
        world,
        bindings: HashMap::new(),
    };

    for ((slot, supplied), schema) in graph.inputs.iter().zip(inputs).zip(schemas) {
        let global = graph
            .spec_of(*slot)
            .expect("graph inputs always carry specs");
        if global != supplied {
            return Err(conversion_err(format!(
                "input {slot} spec mismatch: graph has {global}, caller supplied {supplied}"
            )));
        }
        let local = converter.local_input_spec(global, schema)?;
        trace!(input = %slot, placement = ?schema.placement(), spec = %local, "placed input");
        converter.out.specs.insert(*slot, local);
        converter
            .bindings
            .insert(*slot, (*slot, schema.placement()));
    }

    for node in &graph.nodes {
        converter.convert_node(node)?;
    }

    let mut outputs = Vec::with_capacity(graph.outputs.len());
    for value in &graph.outputs {
        outputs.push(converter.resolve(*value)?.0);
    }
    converter.out.outputs = outputs;

    debug!(
        world,
        nodes_before = graph.nodes.len(),
        nodes_after = converter.out.nodes.len(),
        "distributed conversion complete"
    );
    Ok(converter.out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::graph::{Op, Session};
    use crate::spmd::{DeviceGrid, Placement, Schema};
    use crate::tensor::{Shape, TensorSpec};

    use super::*;

    fn schemas(grid: &Arc<DeviceGrid>, placements: &[Placement]) -> Vec<Schema> {
        placements
            .iter()
            .map(|p| Schema::new(Arc::clone(grid), vec![*p]))
            .collect()
    }

    #[test]
    fn sharded_elementwise_stays_local() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([8, 3]));
        let a = session.input(spec.clone()).unwrap();
        let b = session.input(spec.clone()).unwrap();
        let out = session.add(&a, &b).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(4));
        let dist = convert_to_distributed(
            graph,
            &[spec.clone(), spec],
            &schemas(&grid, &[Placement::Shard(0), Placement::Shard(0)]),
            false,
        )
        .unwrap();

        assert!(dist.nodes().iter().all(|n| !n.op.is_collective()));
        let add = &dist.nodes()[0];
        assert_eq!(add.spec.shape.dims(), &[2, 3]);
    }

    #[test]
    fn mismatched_placements_gather_to_replicate() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([8, 3]));
        let a = session.input(spec.clone()).unwrap();
        let b = session.input(spec.clone()).unwrap();
        let out = session.add(&a, &b).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(4));
        let dist = convert_to_distributed(
            graph,
            &[spec.clone(), spec],
            &schemas(&grid, &[Placement::Shard(0), Placement::Replicate]),
            false,
        )
        .unwrap();

        let gathers = dist
            .nodes()
            .iter()
            .filter(|n| matches!(n.op, Op::AllGather { .. }))
            .count();
        assert_eq!(gathers, 1);
        let add = dist.nodes().last().unwrap();
        assert_eq!(add.op, Op::Add);
        assert_eq!(add.spec.shape.dims(), &[8, 3]);
    }

    #[test]
    fn sharded_reduction_inserts_all_reduce() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([8, 3]));
        let x = session.input(spec.clone()).unwrap();
        let out = session.mean(&x).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(2));
        let dist = convert_to_distributed(
            graph,
            &[spec],
            &schemas(&grid, &[Placement::Shard(0)]),
            false,
        )
        .unwrap();

        let ops: Vec<_> = dist.nodes().iter().map(|n| n.op.clone()).collect();
        assert_eq!(
            ops,
            vec![Op::Mean, Op::AllReduce { parts: 2 }, Op::MulScalar(0.5)]
        );
    }

    #[test]
    fn sharding_a_scalar_fails() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::scalar());
        let x = session.input(spec.clone()).unwrap();
        let out = session.neg(&x).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(2));
        let err = convert_to_distributed(
            graph,
            &[spec],
            &schemas(&grid, &[Placement::Shard(0)]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::PlacementConversion(_)));
    }

    #[test]
    fn indivisible_shard_dim_fails() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([7, 3]));
        let x = session.input(spec.clone()).unwrap();
        let out = session.neg(&x).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(2));
        let err = convert_to_distributed(
            graph,
            &[spec],
            &schemas(&grid, &[Placement::Shard(0)]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::PlacementConversion(_)));
    }

    #[test]
    fn partial_conversion_is_refused() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([2]));
        let x = session.input(spec.clone()).unwrap();
        let out = session.neg(&x).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let grid = Arc::new(DeviceGrid::new(2));
        let err = convert_to_distributed(
            graph,
            &[spec],
            &schemas(&grid, &[Placement::Replicate]),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Unimplemented(_)));
    }

    #[test]
    fn copy_back_redistributes_to_destination_placement() {
        use crate::passes::functionalize;

        let mut session = Session::trace();
        let param_spec = TensorSpec::f32(Shape::new([4, 2]));
        let param = session.input(param_spec.clone()).unwrap();
        let grad = session.input(param_spec.clone()).unwrap();
        session.sub_assign(&param, &grad).unwrap();
        let graph = functionalize(session.finish(&[]).unwrap()).unwrap();

        let grid = Arc::new(DeviceGrid::new(2));
        // Parameter replicated, gradient arriving sharded.
        let dist = convert_to_distributed(
            graph,
            &[param_spec.clone(), param_spec],
            &schemas(&grid, &[Placement::Replicate, Placement::Shard(0)]),
            false,
        )
        .unwrap();

        let copy = dist
            .nodes()
            .iter()
            .find(|n| n.op == Op::CopyInto)
            .expect("epilogue survives expansion");
        assert_eq!(copy.spec.shape.dims(), &[4, 2]);
        assert!(dist
            .nodes()
            .iter()
            .any(|n| matches!(n.op, Op::AllGather { .. })));
    }
}
