//! Shape-only placeholder tensors and the shape-inference context that
//! produces them.
//!
//! A [`FakeTensor`] stands in for a real tensor during compilation: it
//! carries the spec (shape, dtype, device) but no data, so no real
//! computation or memory is touched while the pipeline discovers state
//! structure and traces the step body.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{HostTensor, TensorSpec};

static NEXT_MODE_ID: AtomicU64 = AtomicU64::new(0);

/// Shape-inference context. All placeholders flowing through one compilation
/// must originate from the same mode; the compiler rejects mixed contexts.
#[derive(Debug)]
pub struct FakeMode {
    id: u64,
    allow_non_fake_inputs: AtomicBool,
}

impl FakeMode {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeMode {
            id: NEXT_MODE_ID.fetch_add(1, Ordering::Relaxed),
            allow_non_fake_inputs: AtomicBool::new(false),
        })
    }

    /// Stable identifier distinguishing this context from others.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether real tensors are currently tolerated alongside placeholders.
    pub fn allows_non_fake_inputs(&self) -> bool {
        self.allow_non_fake_inputs.load(Ordering::Relaxed)
    }

    /// Raises the permissive flag for the lifetime of the returned guard.
    /// The warm-up pass uses this so step bodies that close over real
    /// constants still shape-check.
    pub fn allow_non_fake_scope(self: &Arc<Self>) -> NonFakeInputsGuard {
        self.allow_non_fake_inputs.store(true, Ordering::Relaxed);
        NonFakeInputsGuard {
            mode: Arc::clone(self),
        }
    }

    /// Produces a placeholder mirroring a real tensor's spec.
    pub fn from_tensor(self: &Arc<Self>, tensor: &HostTensor) -> FakeTensor {
        self.from_spec(tensor.spec().clone())
    }

    /// Produces a placeholder with the given spec.
    pub fn from_spec(self: &Arc<Self>, spec: TensorSpec) -> FakeTensor {
        FakeTensor {
            spec,
            mode: Arc::clone(self),
        }
    }
}

/// Scope guard restoring the strict no-real-inputs behavior on drop.
pub struct NonFakeInputsGuard {
    mode: Arc<FakeMode>,
}

impl Drop for NonFakeInputsGuard {
    fn drop(&mut self) {
        self.mode.allow_non_fake_inputs.store(false, Ordering::Relaxed);
    }
}

/// A spec-tagged stand-in for a real tensor. Carries no data; the identity
/// of the cell holding it is what later maps back to optimizer state.
#[derive(Debug, Clone)]
pub struct FakeTensor {
    spec: TensorSpec,
    mode: Arc<FakeMode>,
}

impl FakeTensor {
    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn mode(&self) -> &Arc<FakeMode> {
        &self.mode
    }
}
