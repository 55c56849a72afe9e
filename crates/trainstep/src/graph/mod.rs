//! Computation graph IR.
//!
//! A [`Graph`] is an ordered list of operation nodes over explicit input
//! slots. Graphs are owned by value: each pipeline stage (trace,
//! functionalize, expand) consumes a graph and returns a new one, so no
//! stage ever observes another's mutations.

pub(crate) mod infer;
mod interp;
mod session;

pub use interp::{GraphExecutor, Interpreter};
pub use session::Session;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::spmd::Schema;
use crate::tensor::TensorSpec;

/// Identifier of a value slot inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Graph operations.
///
/// Mutation variants update their first operand in place; the
/// functionalization pass rewrites them into their pure counterparts plus a
/// copy-back epilogue. Collective variants are inserted by distributed
/// expansion and executed by the external communication runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // Pure elementwise / linear algebra.
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    AddScalar(f32),
    MulScalar(f32),
    MatMul,
    Transpose,
    Sum,
    Mean,
    /// Materializes an all-zero tensor of the node's spec.
    Zeros,

    // In-place mutation of the first operand.
    AddAssign,
    SubAssign,
    MulScalarAssign(f32),
    /// Copies the second operand's value into the first operand's slot.
    CopyInto,

    // Cross-device redistribution over a 1-D grid of `parts` devices.
    AllGather { dim: usize, parts: usize },
    SplitShard { dim: usize, parts: usize },
    AllReduce { parts: usize },
}

impl Op {
    /// Whether this operation mutates its first operand.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::AddAssign | Op::SubAssign | Op::MulScalarAssign(_) | Op::CopyInto
        )
    }

    /// Whether this operation moves data between devices.
    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            Op::AllGather { .. } | Op::SplitShard { .. } | Op::AllReduce { .. }
        )
    }

    fn display_name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::AddScalar(_) => "add_scalar",
            Op::MulScalar(_) => "mul_scalar",
            Op::MatMul => "matmul",
            Op::Transpose => "transpose",
            Op::Sum => "sum",
            Op::Mean => "mean",
            Op::Zeros => "zeros",
            Op::AddAssign => "add_",
            Op::SubAssign => "sub_",
            Op::MulScalarAssign(_) => "mul_scalar_",
            Op::CopyInto => "copy_into",
            Op::AllGather { .. } => "all_gather",
            Op::SplitShard { .. } => "split_shard",
            Op::AllReduce { .. } => "all_reduce",
        }
    }
}

/// One recorded operation.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: ValueId,
    pub op: Op,
    pub inputs: SmallVec<[ValueId; 2]>,
    pub spec: TensorSpec,
}

/// An immutable dataflow graph with explicit inputs and outputs.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) outputs: Vec<ValueId>,
    pub(crate) specs: HashMap<ValueId, TensorSpec>,
    pub(crate) next_value: u32,
    /// Per-input placement schemas, present after distributed expansion.
    pub(crate) input_schemas: Option<Vec<Schema>>,
}

impl Graph {
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Spec of any value slot (input or node output) in this graph.
    pub fn spec_of(&self, value: ValueId) -> Option<&TensorSpec> {
        self.specs.get(&value)
    }

    /// Placement schemas attached by distributed expansion, one per input.
    pub fn input_schemas(&self) -> Option<&[Schema]> {
        self.input_schemas.as_deref()
    }

    /// Whether any in-place mutation node other than the copy-back epilogue
    /// remains in the graph.
    pub fn has_non_epilogue_mutations(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.op.is_mutation() && n.op != Op::CopyInto)
    }

    pub(crate) fn allocate_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "graph(")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.specs.get(input) {
                Some(spec) => write!(f, "{input}: {spec}")?,
                None => write!(f, "{input}")?,
            }
        }
        writeln!(f, "):")?;
        for node in &self.nodes {
            write!(f, "  {} = {}(", node.id, node.op.display_name())?;
            for (i, operand) in node.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{operand}")?;
            }
            writeln!(f, ") : {}", node.spec)?;
        }
        write!(f, "  return (")?;
        for (i, output) in self.outputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{output}")?;
        }
        write!(f, ")")
    }
}
