//! Identity-keyed shared tensor cells.
//!
//! Parameters, buffers, and optimizer state leaves are all [`TensorCell`]s:
//! cheaply clonable handles whose pointer identity ([`CellId`]) is stable
//! across rebinding of their contents. The optimizer addresses state by cell
//! identity, and the tracer keys graph inputs the same way, which is what
//! lets the rematerializer translate between the two worlds.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::graph::ValueId;

use super::{FakeTensor, HostTensor, TensorSpec};

/// The contents of a cell at some point in the pipeline.
#[derive(Debug, Clone)]
pub enum TensorValue {
    /// A real tensor with data in host memory.
    Real(HostTensor),
    /// A shape-only placeholder from a shape-inference context.
    Fake(FakeTensor),
    /// A value recorded in a trace, identified by its graph slot.
    Traced { value: ValueId, spec: TensorSpec },
}

impl TensorValue {
    pub fn spec(&self) -> &TensorSpec {
        match self {
            TensorValue::Real(t) => t.spec(),
            TensorValue::Fake(f) => f.spec(),
            TensorValue::Traced { spec, .. } => spec,
        }
    }
}

#[derive(Debug)]
struct CellInner {
    value: RefCell<TensorValue>,
    /// Accumulated gradient, populated by gradient computation and consumed
    /// by optimizers. Buffers and plain values simply never get one.
    grad: RefCell<Option<TensorCell>>,
}

/// Shared, identity-carrying handle to a tensor value.
#[derive(Debug, Clone)]
pub struct TensorCell(Rc<CellInner>);

/// Stable identity of a cell, derived from its allocation. Two clones of the
/// same cell share an id; a fresh cell never aliases an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(usize);

impl TensorCell {
    pub fn new(value: TensorValue) -> Self {
        TensorCell(Rc::new(CellInner {
            value: RefCell::new(value),
            grad: RefCell::new(None),
        }))
    }

    pub fn real(tensor: HostTensor) -> Self {
        TensorCell::new(TensorValue::Real(tensor))
    }

    pub fn fake(fake: FakeTensor) -> Self {
        TensorCell::new(TensorValue::Fake(fake))
    }

    pub fn id(&self) -> CellId {
        CellId(Rc::as_ptr(&self.0) as *const () as usize)
    }

    /// Whether two handles refer to the same cell.
    pub fn same_cell(&self, other: &TensorCell) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn borrow(&self) -> Ref<'_, TensorValue> {
        self.0.value.borrow()
    }

    /// Replaces the cell's contents, preserving its identity.
    pub fn set(&self, value: TensorValue) {
        *self.0.value.borrow_mut() = value;
    }

    pub fn spec(&self) -> TensorSpec {
        self.0.value.borrow().spec().clone()
    }

    pub fn is_real(&self) -> bool {
        matches!(&*self.0.value.borrow(), TensorValue::Real(_))
    }

    pub fn is_fake(&self) -> bool {
        matches!(&*self.0.value.borrow(), TensorValue::Fake(_))
    }

    /// The graph slot this cell is bound to, when traced.
    pub fn traced_value(&self) -> Option<ValueId> {
        match &*self.0.value.borrow() {
            TensorValue::Traced { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Clones the contained real tensor, if any.
    pub fn to_host(&self) -> Option<HostTensor> {
        match &*self.0.value.borrow() {
            TensorValue::Real(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Mutates the contained real tensor in place.
    pub fn with_real_mut<R>(
        &self,
        f: impl FnOnce(&mut HostTensor) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        match &mut *self.0.value.borrow_mut() {
            TensorValue::Real(t) => f(t),
            other => anyhow::bail!("expected a real tensor, got {:?}", other.spec()),
        }
    }

    /// Attaches a gradient value to this cell.
    pub fn set_grad(&self, grad: TensorCell) {
        *self.0.grad.borrow_mut() = Some(grad);
    }

    /// The currently attached gradient, if any.
    pub fn grad(&self) -> Option<TensorCell> {
        self.0.grad.borrow().clone()
    }

    /// Detaches and returns the gradient.
    pub fn take_grad(&self) -> Option<TensorCell> {
        self.0.grad.borrow_mut().take()
    }
}
