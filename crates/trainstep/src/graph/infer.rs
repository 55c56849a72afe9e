//! Per-operation output spec rules shared by the session, the interpreter,
//! and the distributed converter.

use anyhow::{bail, ensure, Result};

use crate::tensor::{Shape, TensorSpec};

use super::Op;

fn ensure_same(lhs: &TensorSpec, rhs: &TensorSpec, what: &str) -> Result<()> {
    ensure!(
        lhs == rhs,
        "{what} operands must share spec: {lhs} vs {rhs}"
    );
    Ok(())
}

/// Computes the output spec of `op` applied to operands with `inputs` specs.
/// Mutation ops report the spec of the slot they update.
pub(crate) fn output_spec(op: &Op, inputs: &[&TensorSpec]) -> Result<TensorSpec> {
    let arity = |n: usize| -> Result<()> {
        ensure!(
            inputs.len() == n,
            "{:?} expects {n} operands, got {}",
            op,
            inputs.len()
        );
        Ok(())
    };

    match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div => {
            arity(2)?;
            ensure_same(inputs[0], inputs[1], "elementwise")?;
            Ok(inputs[0].clone())
        }
        Op::Neg | Op::AddScalar(_) | Op::MulScalar(_) => {
            arity(1)?;
            Ok(inputs[0].clone())
        }
        Op::MatMul => {
            arity(2)?;
            let (lhs, rhs) = (inputs[0], inputs[1]);
            ensure!(
                lhs.dtype == rhs.dtype && lhs.device == rhs.device,
                "matmul operands must share dtype and device: {lhs} vs {rhs}"
            );
            let (ld, rd) = (lhs.shape.dims(), rhs.shape.dims());
            ensure!(
                ld.len() == 2 && rd.len() == 2,
                "matmul expects rank-2 operands, got {} and {}",
                lhs.shape,
                rhs.shape
            );
            ensure!(
                ld[1] == rd[0],
                "matmul contraction mismatch: {} vs {}",
                lhs.shape,
                rhs.shape
            );
            Ok(TensorSpec::new(
                lhs.dtype,
                Shape::new([ld[0], rd[1]]),
                lhs.device,
            ))
        }
        Op::Transpose => {
            arity(1)?;
            let dims = inputs[0].shape.dims();
            ensure!(
                dims.len() == 2,
                "transpose expects a rank-2 operand, got {}",
                inputs[0].shape
            );
            Ok(TensorSpec::new(
                inputs[0].dtype,
                Shape::new([dims[1], dims[0]]),
                inputs[0].device,
            ))
        }
        Op::Sum | Op::Mean => {
            arity(1)?;
            ensure!(
                inputs[0].shape.num_elements() > 0,
                "full reduction of an empty tensor is undefined"
            );
            Ok(TensorSpec::new(
                inputs[0].dtype,
                Shape::scalar(),
                inputs[0].device,
            ))
        }
        Op::Zeros => bail!("zeros carries its own spec and is not inferred"),
        Op::AddAssign | Op::SubAssign => {
            arity(2)?;
            ensure_same(inputs[0], inputs[1], "in-place")?;
            Ok(inputs[0].clone())
        }
        Op::MulScalarAssign(_) => {
            arity(1)?;
            Ok(inputs[0].clone())
        }
        Op::CopyInto => {
            arity(2)?;
            ensure_same(inputs[0], inputs[1], "copy")?;
            Ok(inputs[0].clone())
        }
        Op::AllGather { dim, parts } => {
            arity(1)?;
            let shape = &inputs[0].shape;
            ensure!(*dim < shape.rank(), "all_gather dim out of range");
            Ok(TensorSpec::new(
                inputs[0].dtype,
                shape.with_dim_scaled(*dim, *parts),
                inputs[0].device,
            ))
        }
        Op::SplitShard { dim, parts } => {
            arity(1)?;
            let shape = &inputs[0].shape;
            ensure!(*dim < shape.rank(), "split_shard dim out of range");
            ensure!(
                shape.dims()[*dim] % parts == 0,
                "split_shard dim {} of {} does not divide into {} parts",
                dim,
                shape,
                parts
            );
            Ok(TensorSpec::new(
                inputs[0].dtype,
                shape.with_dim_divided(*dim, *parts),
                inputs[0].device,
            ))
        }
        Op::AllReduce { .. } => {
            arity(1)?;
            Ok(inputs[0].clone())
        }
    }
}
