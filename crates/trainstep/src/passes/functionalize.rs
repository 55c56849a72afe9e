//! Removes in-place mutation from a traced graph.
//!
//! Every mutation node becomes its pure counterpart producing a fresh value;
//! an alias map redirects later reads of the mutated slot to the latest
//! value. Graph inputs whose final value moved get one `copy_into` epilogue
//! node each, restoring the observable write-back semantics. The result has
//! identical behavior and no hidden aliasing, which is what ahead-of-time
//! executors and the distributed expansion assume.
//!
//! Gradients need no special handling here: reverse-mode bookkeeping already
//! happened upstream, so gradient computation arrives as ordinary nodes.

use std::collections::HashMap;

use smallvec::smallvec;

use crate::error::CompileResult;
use crate::graph::{Graph, Node, Op, ValueId};

pub fn functionalize(graph: Graph) -> CompileResult<Graph> {
    let Graph {
        inputs,
        nodes,
        outputs,
        mut specs,
        mut next_value,
        input_schemas,
    } = graph;

    // alias[v] = the value currently holding v's contents.
    let mut alias: HashMap<ValueId, ValueId> = HashMap::new();
    let resolve = |alias: &HashMap<ValueId, ValueId>, value: ValueId| -> ValueId {
        *alias.get(&value).unwrap_or(&value)
    };

    let mut rewritten = Vec::with_capacity(nodes.len());
    for node in nodes {
        let Node {
            id,
            op,
            inputs: operands,
            spec,
        } = node;

        if let Op::CopyInto = op {
            // A traced copy is pure aliasing once mutation is explicit.
            let src = resolve(&alias, operands[1]);
            alias.insert(operands[0], src);
            continue;
        }

        let pure_op = match op {
            Op::AddAssign => Some(Op::Add),
            Op::SubAssign => Some(Op::Sub),
            Op::MulScalarAssign(factor) => Some(Op::MulScalar(factor)),
            _ => None,
        };

        match pure_op {
            Some(pure_op) => {
                let dest = operands[0];
                let mapped = operands.iter().map(|v| resolve(&alias, *v)).collect();
                rewritten.push(Node {
                    id,
                    op: pure_op,
                    inputs: mapped,
                    spec,
                });
                alias.insert(dest, id);
            }
            None => {
                let mapped = operands.iter().map(|v| resolve(&alias, *v)).collect();
                rewritten.push(Node {
                    id,
                    op,
                    inputs: mapped,
                    spec,
                });
            }
        }
    }

    // Mutation epilogue: one explicit write-back per moved input slot, in
    // input order.
    for input in &inputs {
        let latest = resolve(&alias, *input);
        if latest != *input {
            let id = ValueId(next_value);
            next_value += 1;
            let spec = specs
                .get(input)
                .expect("graph inputs always carry specs")
                .clone();
            specs.insert(id, spec.clone());
            rewritten.push(Node {
                id,
                op: Op::CopyInto,
                inputs: smallvec![*input, latest],
                spec,
            });
        }
    }

    let outputs = outputs.into_iter().map(|v| resolve(&alias, v)).collect();

    Ok(Graph {
        inputs,
        nodes: rewritten,
        outputs,
        specs,
        next_value,
        input_schemas,
    })
}

#[cfg(test)]
mod tests {
    use crate::graph::{Op, Session};
    use crate::tensor::{HostTensor, Shape, TensorCell, TensorSpec};

    use super::functionalize;

    #[test]
    fn mutation_chain_becomes_pure_ops_with_epilogue() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([2]));
        let param = session.input(spec.clone()).unwrap();
        let grad = session.input(spec).unwrap();

        // param -= 0.1 * (2 * grad), twice, like two unrolled updates.
        let update = session.mul_scalar(&grad, 2.0).unwrap();
        let scaled = session.mul_scalar(&update, 0.1).unwrap();
        session.sub_assign(&param, &scaled).unwrap();
        session.sub_assign(&param, &scaled).unwrap();
        let graph = session.finish(&[]).unwrap();
        assert!(graph.has_non_epilogue_mutations());

        let pure = functionalize(graph).unwrap();
        assert!(!pure.has_non_epilogue_mutations());

        let ops: Vec<_> = pure.nodes().iter().map(|n| n.op.clone()).collect();
        assert_eq!(
            ops,
            vec![
                Op::MulScalar(2.0),
                Op::MulScalar(0.1),
                Op::Sub,
                Op::Sub,
                Op::CopyInto,
            ]
        );
        // The second subtraction chains off the first, not off the input.
        let subs: Vec<_> = pure.nodes().iter().filter(|n| n.op == Op::Sub).collect();
        assert_eq!(subs[1].inputs[0], subs[0].id);
        // The epilogue writes the final value back into the input slot.
        let epilogue = pure.nodes().last().unwrap();
        assert_eq!(epilogue.inputs[0], pure.inputs()[0]);
        assert_eq!(epilogue.inputs[1], subs[1].id);
    }

    #[test]
    fn untouched_inputs_get_no_epilogue() {
        let mut session = Session::trace();
        let a = session.input(TensorSpec::f32(Shape::new([2]))).unwrap();
        let b = session.input(TensorSpec::f32(Shape::new([2]))).unwrap();
        let out = session.add(&a, &b).unwrap();
        let graph = session.finish(&[out]).unwrap();

        let pure = functionalize(graph).unwrap();
        assert!(pure.nodes().iter().all(|n| n.op != Op::CopyInto));
        assert_eq!(pure.nodes().len(), 1);
    }

    #[test]
    fn functionalized_graph_executes_with_write_back() {
        use crate::graph::{GraphExecutor, Interpreter};

        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([2]));
        let param = session.input(spec.clone()).unwrap();
        let grad = session.input(spec).unwrap();
        session.sub_assign(&param, &grad).unwrap();
        let graph = session.finish(&[]).unwrap();
        let pure = functionalize(graph).unwrap();

        let param_cell = TensorCell::real(
            HostTensor::from_vec(Shape::new([2]), vec![1.0, 2.0]).unwrap(),
        );
        let grad_cell = TensorCell::real(
            HostTensor::from_vec(Shape::new([2]), vec![0.5, 0.5]).unwrap(),
        );
        Interpreter
            .run(&pure, &[param_cell.clone(), grad_cell])
            .unwrap();
        assert_eq!(param_cell.to_host().unwrap().data(), &[0.5, 1.5]);
    }

    #[test]
    fn traced_copies_collapse_to_aliases() {
        let mut session = Session::trace();
        let spec = TensorSpec::f32(Shape::new([2]));
        let a = session.input(spec.clone()).unwrap();
        let b = session.input(spec).unwrap();
        session.copy_into(&a, &b).unwrap();
        let doubled = session.mul_scalar(&a, 2.0).unwrap();
        let graph = session.finish(&[doubled]).unwrap();

        let pure = functionalize(graph).unwrap();
        // mul_scalar now reads b directly; the epilogue restores a's slot.
        assert_eq!(pure.nodes()[0].op, Op::MulScalar(2.0));
        assert_eq!(pure.nodes()[0].inputs[0], pure.inputs()[1]);
        let epilogue = pure.nodes().last().unwrap();
        assert_eq!(epilogue.op, Op::CopyInto);
        assert_eq!(epilogue.inputs[0], pure.inputs()[0]);
        assert_eq!(epilogue.inputs[1], pure.inputs()[1]);
    }
}
