//! Evaluation sessions: the single op-emission surface step bodies and
//! optimizers are written against.
//!
//! The same body code runs under three session kinds:
//! - `eager`: operations execute immediately on real host tensors;
//! - `shape`: operations only propagate specs through shape-only
//!   placeholders (the warm-up pass);
//! - `trace`: operations are recorded into a [`Graph`] while specs
//!   propagate (the full-graph trace).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::tensor::{FakeMode, HostTensor, TensorCell, TensorSpec, TensorValue};

use super::interp::eval_node;
use super::{infer, Graph, Node, Op, ValueId};

enum SessionKind {
    Eager,
    Shape { mode: Arc<FakeMode> },
    Trace { rec: Recorder },
}

struct Recorder {
    inputs: Vec<ValueId>,
    nodes: Vec<Node>,
    specs: HashMap<ValueId, TensorSpec>,
    next_value: u32,
}

impl Recorder {
    fn allocate(&mut self, spec: TensorSpec) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        self.specs.insert(value, spec);
        value
    }
}

/// An evaluation context for step bodies and optimizer updates.
pub struct Session {
    kind: SessionKind,
}

impl Session {
    /// Immediate execution on real tensors.
    pub fn eager() -> Self {
        Session {
            kind: SessionKind::Eager,
        }
    }

    /// Shape-only propagation inside the given shape-inference context.
    pub fn shape(mode: Arc<FakeMode>) -> Self {
        Session {
            kind: SessionKind::Shape { mode },
        }
    }

    /// Graph recording. Specs propagate through the recorded nodes; no
    /// shape-inference context is needed because trace values carry their
    /// specs explicitly.
    pub fn trace() -> Self {
        Session {
            kind: SessionKind::Trace {
                rec: Recorder {
                    inputs: Vec::new(),
                    nodes: Vec::new(),
                    specs: HashMap::new(),
                    next_value: 0,
                },
            },
        }
    }

    /// Declares a new graph input placeholder. Trace sessions only; input
    /// order defines the traced graph's calling convention.
    pub fn input(&mut self, spec: TensorSpec) -> Result<TensorCell> {
        match &mut self.kind {
            SessionKind::Trace { rec, .. } => {
                let value = rec.allocate(spec.clone());
                rec.inputs.push(value);
                Ok(TensorCell::new(TensorValue::Traced { value, spec }))
            }
            _ => bail!("graph inputs can only be declared in a trace session"),
        }
    }

    /// Consumes the session and returns the recorded graph. The declared
    /// outputs must all be values traced in this session.
    pub fn finish(self, outputs: &[TensorCell]) -> Result<Graph> {
        match self.kind {
            SessionKind::Trace { rec, .. } => {
                let mut output_ids = Vec::with_capacity(outputs.len());
                for cell in outputs {
                    let Some(value) = cell.traced_value() else {
                        bail!("graph outputs must be traced values");
                    };
                    ensure!(
                        rec.specs.contains_key(&value),
                        "output {value} was not traced in this session"
                    );
                    output_ids.push(value);
                }
                Ok(Graph {
                    inputs: rec.inputs,
                    nodes: rec.nodes,
                    outputs: output_ids,
                    specs: rec.specs,
                    next_value: rec.next_value,
                    input_schemas: None,
                })
            }
            _ => bail!("only trace sessions produce graphs"),
        }
    }

    fn check_operand(kind: &SessionKind, cell: &TensorCell) -> Result<()> {
        match (&*cell.borrow(), kind) {
            (TensorValue::Real(_), SessionKind::Eager) => Ok(()),
            (TensorValue::Real(_), SessionKind::Shape { mode }) => {
                ensure!(
                    mode.allows_non_fake_inputs(),
                    "real tensor reached a shape session outside a permissive scope"
                );
                Ok(())
            }
            (TensorValue::Fake(fake), SessionKind::Shape { mode }) => {
                ensure!(
                    fake.mode().id() == mode.id(),
                    "placeholder comes from a different shape-inference context"
                );
                Ok(())
            }
            (TensorValue::Traced { .. }, SessionKind::Trace { .. }) => Ok(()),
            (value, SessionKind::Eager) => {
                bail!("eager session expects real tensors, got {}", value.spec())
            }
            (value, SessionKind::Shape { .. }) => {
                bail!("shape session expects placeholders, got {}", value.spec())
            }
            (value, SessionKind::Trace { .. }) => bail!(
                "trace session expects traced values, got {}; constants must be \
                 registered as graph inputs",
                value.spec()
            ),
        }
    }

    fn apply(
        &mut self,
        op: Op,
        explicit_spec: Option<TensorSpec>,
        operands: &[&TensorCell],
    ) -> Result<TensorCell> {
        for cell in operands {
            Self::check_operand(&self.kind, cell)?;
        }
        let specs: Vec<TensorSpec> = operands.iter().map(|c| c.spec()).collect();
        let spec_refs: Vec<&TensorSpec> = specs.iter().collect();
        let out_spec = match explicit_spec {
            Some(spec) => spec,
            None => infer::output_spec(&op, &spec_refs)?,
        };

        match &mut self.kind {
            SessionKind::Eager => {
                let hosts: Vec<HostTensor> = operands
                    .iter()
                    .map(|c| c.to_host().expect("operands checked real above"))
                    .collect();
                Ok(TensorCell::real(eval_node(&op, &out_spec, &hosts)?))
            }
            SessionKind::Shape { mode } => Ok(TensorCell::fake(mode.from_spec(out_spec))),
            SessionKind::Trace { rec, .. } => {
                let inputs: SmallVec<[ValueId; 2]> = operands
                    .iter()
                    .map(|c| c.traced_value().expect("operands checked traced above"))
                    .collect();
                let value = rec.allocate(out_spec.clone());
                rec.nodes.push(Node {
                    id: value,
                    op,
                    inputs,
                    spec: out_spec.clone(),
                });
                Ok(TensorCell::new(TensorValue::Traced {
                    value,
                    spec: out_spec,
                }))
            }
        }
    }

    fn apply_assign(&mut self, op: Op, dest: &TensorCell, srcs: &[&TensorCell]) -> Result<()> {
        Self::check_operand(&self.kind, dest)?;
        for cell in srcs {
            Self::check_operand(&self.kind, cell)?;
        }
        let mut specs: Vec<TensorSpec> = vec![dest.spec()];
        specs.extend(srcs.iter().map(|c| c.spec()));
        let spec_refs: Vec<&TensorSpec> = specs.iter().collect();
        let out_spec = infer::output_spec(&op, &spec_refs)?;

        match &mut self.kind {
            SessionKind::Eager => {
                let dest_host = dest.to_host().expect("dest checked real above");
                let src_hosts: Vec<HostTensor> = srcs
                    .iter()
                    .map(|c| c.to_host().expect("operands checked real above"))
                    .collect();
                let updated = match (&op, src_hosts.as_slice()) {
                    (Op::AddAssign, [src]) => dest_host.add(src)?,
                    (Op::SubAssign, [src]) => dest_host.sub(src)?,
                    (Op::MulScalarAssign(factor), []) => dest_host.mul_scalar(*factor),
                    (Op::CopyInto, [src]) => src.clone(),
                    _ => bail!("{:?} is not an in-place operation", op),
                };
                dest.with_real_mut(|t| t.copy_from(&updated))
            }
            SessionKind::Shape { mode } => {
                // Mutation makes the destination a placeholder even when a
                // real tensor was tolerated as input; real data is never
                // clobbered by shape-only evaluation.
                dest.set(TensorValue::Fake(mode.from_spec(out_spec)));
                Ok(())
            }
            SessionKind::Trace { rec, .. } => {
                let mut inputs: SmallVec<[ValueId; 2]> = SmallVec::new();
                inputs.push(dest.traced_value().expect("dest checked traced above"));
                for cell in srcs {
                    inputs.push(cell.traced_value().expect("operands checked traced above"));
                }
                // The node's own slot is never read back; in-place semantics
                // are defined by node order until functionalization.
                let value = rec.allocate(out_spec.clone());
                rec.nodes.push(Node {
                    id: value,
                    op,
                    inputs,
                    spec: out_spec,
                });
                Ok(())
            }
        }
    }

    pub fn add(&mut self, lhs: &TensorCell, rhs: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Add, None, &[lhs, rhs])
    }

    pub fn sub(&mut self, lhs: &TensorCell, rhs: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Sub, None, &[lhs, rhs])
    }

    pub fn mul(&mut self, lhs: &TensorCell, rhs: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Mul, None, &[lhs, rhs])
    }

    pub fn div(&mut self, lhs: &TensorCell, rhs: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Div, None, &[lhs, rhs])
    }

    pub fn neg(&mut self, value: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Neg, None, &[value])
    }

    pub fn add_scalar(&mut self, value: &TensorCell, scalar: f32) -> Result<TensorCell> {
        self.apply(Op::AddScalar(scalar), None, &[value])
    }

    pub fn mul_scalar(&mut self, value: &TensorCell, scalar: f32) -> Result<TensorCell> {
        self.apply(Op::MulScalar(scalar), None, &[value])
    }

    pub fn matmul(&mut self, lhs: &TensorCell, rhs: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::MatMul, None, &[lhs, rhs])
    }

    pub fn transpose(&mut self, value: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Transpose, None, &[value])
    }

    pub fn sum(&mut self, value: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Sum, None, &[value])
    }

    pub fn mean(&mut self, value: &TensorCell) -> Result<TensorCell> {
        self.apply(Op::Mean, None, &[value])
    }

    /// An all-zero tensor of the given spec. This is how optimizers
    /// materialize fresh state, which is what makes the warm-up pass's
    /// zero-initialization contract hold.
    pub fn zeros(&mut self, spec: TensorSpec) -> Result<TensorCell> {
        self.apply(Op::Zeros, Some(spec), &[])
    }

    pub fn add_assign(&mut self, dest: &TensorCell, src: &TensorCell) -> Result<()> {
        self.apply_assign(Op::AddAssign, dest, &[src])
    }

    pub fn sub_assign(&mut self, dest: &TensorCell, src: &TensorCell) -> Result<()> {
        self.apply_assign(Op::SubAssign, dest, &[src])
    }

    pub fn mul_scalar_assign(&mut self, dest: &TensorCell, scalar: f32) -> Result<()> {
        self.apply_assign(Op::MulScalarAssign(scalar), dest, &[])
    }

    pub fn copy_into(&mut self, dest: &TensorCell, src: &TensorCell) -> Result<()> {
        self.apply_assign(Op::CopyInto, dest, &[src])
    }
}

impl Graph {
    /// Re-executes this graph's operations through a session, mapping graph
    /// inputs onto the given cells positionally. Under a trace session this
    /// reproduces the graph node for node; under an eager session it
    /// evaluates it. This is the form in which an externally captured graph
    /// enters the pipeline.
    pub fn replay(&self, session: &mut Session, inputs: &[TensorCell]) -> Result<Vec<TensorCell>> {
        ensure!(
            inputs.len() == self.inputs.len(),
            "graph expects {} inputs, got {}",
            self.inputs.len(),
            inputs.len()
        );
        let mut env: HashMap<ValueId, TensorCell> = HashMap::new();
        for (slot, cell) in self.inputs.iter().zip(inputs) {
            env.insert(*slot, cell.clone());
        }

        let resolve = |env: &HashMap<ValueId, TensorCell>, value: ValueId| -> Result<TensorCell> {
            env.get(&value)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("replay references undefined value {value}"))
        };

        for node in &self.nodes {
            if node.op.is_mutation() {
                let dest = resolve(&env, node.inputs[0])?;
                let srcs: Vec<TensorCell> = node.inputs[1..]
                    .iter()
                    .map(|v| resolve(&env, *v))
                    .collect::<Result<_>>()?;
                let src_refs: Vec<&TensorCell> = srcs.iter().collect();
                session.apply_assign(node.op.clone(), &dest, &src_refs)?;
                env.insert(node.id, dest);
            } else {
                let operands: Vec<TensorCell> = node
                    .inputs
                    .iter()
                    .map(|v| resolve(&env, *v))
                    .collect::<Result<_>>()?;
                let operand_refs: Vec<&TensorCell> = operands.iter().collect();
                let explicit = matches!(node.op, Op::Zeros).then(|| node.spec.clone());
                let out = session.apply(node.op.clone(), explicit, &operand_refs)?;
                env.insert(node.id, out);
            }
        }

        self.outputs.iter().map(|v| resolve(&env, *v)).collect()
    }
}
