//! The reference graph-level executor: direct evaluation on host tensors.

use anyhow::{anyhow, bail, ensure, Result};

use crate::error::{CompileError, CompileResult};
use crate::tensor::{HostTensor, TensorCell, TensorSpec};

use super::{Graph, Op, Session};

/// A strategy for running a functionalized graph. This is the seam behind
/// which ahead-of-time compilers plug in; strategies are resolved by name
/// through the registry.
pub trait GraphExecutor: Send + Sync {
    /// Human-readable strategy identifier (e.g. `"eager"`).
    fn name(&self) -> &'static str;

    /// Runs the graph over the given input cells. Copy-back epilogue nodes
    /// write through into the input cells; the return value is the graph's
    /// declared outputs.
    fn run(&self, graph: &Graph, inputs: &[TensorCell]) -> CompileResult<Vec<HostTensor>>;
}

/// Evaluates nodes one at a time on the host. Collective operations are
/// rejected; they belong to the external communication runtime.
#[derive(Default)]
pub struct Interpreter;

impl GraphExecutor for Interpreter {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn run(&self, graph: &Graph, inputs: &[TensorCell]) -> CompileResult<Vec<HostTensor>> {
        if graph.has_non_epilogue_mutations() {
            return Err(CompileError::Execution(anyhow!(
                "graph still contains in-place operations; functionalize it first"
            )));
        }
        let mut session = Session::eager();
        let outputs = graph.replay(&mut session, inputs)?;
        outputs
            .iter()
            .map(|cell| {
                cell.to_host()
                    .ok_or_else(|| CompileError::Execution(anyhow!("non-real graph output")))
            })
            .collect()
    }
}

/// Evaluates one pure operation on host tensors.
pub(crate) fn eval_node(op: &Op, out_spec: &TensorSpec, inputs: &[HostTensor]) -> Result<HostTensor> {
    ensure!(
        out_spec.dtype.is_host_computable(),
        "host kernels only evaluate f32, got {:?}",
        out_spec.dtype
    );
    match (op, inputs) {
        (Op::Add, [a, b]) => a.add(b),
        (Op::Sub, [a, b]) => a.sub(b),
        (Op::Mul, [a, b]) => a.mul(b),
        (Op::Div, [a, b]) => a.div(b),
        (Op::Neg, [a]) => Ok(a.neg()),
        (Op::AddScalar(s), [a]) => Ok(a.add_scalar(*s)),
        (Op::MulScalar(s), [a]) => Ok(a.mul_scalar(*s)),
        (Op::MatMul, [a, b]) => a.matmul(b),
        (Op::Transpose, [a]) => a.transpose(),
        (Op::Sum, [a]) => Ok(a.sum()),
        (Op::Mean, [a]) => a.mean(),
        (Op::Zeros, []) => Ok(HostTensor::zeros(out_spec.clone())),
        (op, _) if op.is_collective() => {
            bail!("collective operations require the communication runtime")
        }
        (op, _) if op.is_mutation() => {
            bail!("in-place operation {:?} reached the pure evaluator", op)
        }
        (op, inputs) => bail!("{:?} cannot evaluate {} operands", op, inputs.len()),
    }
}
