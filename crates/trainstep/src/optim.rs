//! Optimizers whose update rule is expressed through session operations, so
//! the same code path runs eagerly, shape-checks, and traces.

use std::collections::HashMap;

use anyhow::Result;

use crate::graph::Session;
use crate::tensor::{CellId, TensorCell};

/// Per-parameter state: an ordered state-name-to-cell mapping.
pub type StateRecord = Vec<(String, TensorCell)>;

/// Optimizer state keyed by parameter cell identity.
pub type StateMap = HashMap<CellId, StateRecord>;

/// The single supported parameter group and its hyperparameters.
pub struct ParamGroup {
    pub params: Vec<TensorCell>,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

/// An optimizer over one parameter group, with identity-keyed state.
///
/// Gradients travel on the parameter cells themselves; entries without an
/// attached gradient (buffers, frozen parameters) are skipped. Multiple
/// parameter groups are not supported; the whole pipeline, the
/// rematerializer included, operates on exactly one group.
pub trait Optimizer {
    fn param_group(&self) -> &ParamGroup;
    fn param_group_mut(&mut self) -> &mut ParamGroup;
    fn state(&self) -> &StateMap;
    fn state_mut(&mut self) -> &mut StateMap;

    /// Applies one update, consuming the gradients attached to the group's
    /// parameters. All arithmetic goes through `session`, including the
    /// in-place parameter and state updates.
    fn step(&mut self, session: &mut Session) -> Result<()>;

    /// Detaches any gradients left on the group's parameters.
    fn zero_grad(&mut self) {
        for param in &self.param_group().params {
            let _ = param.take_grad();
        }
    }
}

/// Stochastic gradient descent with momentum and decoupled weight decay.
///
/// Fresh momentum state is materialized as zeros through the session; the
/// first update then reduces to `buf = grad`, so the zero-initialization
/// contract the warm-up pass depends on holds by construction.
pub struct Sgd {
    group: ParamGroup,
    state: StateMap,
}

impl Sgd {
    pub fn new(params: Vec<TensorCell>, lr: f32) -> Self {
        Sgd {
            group: ParamGroup {
                params,
                lr,
                momentum: 0.9,
                weight_decay: 0.0,
            },
            state: StateMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.group.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.group.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn param_group(&self) -> &ParamGroup {
        &self.group
    }

    fn param_group_mut(&mut self) -> &mut ParamGroup {
        &mut self.group
    }

    fn state(&self) -> &StateMap {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StateMap {
        &mut self.state
    }

    fn step(&mut self, session: &mut Session) -> Result<()> {
        let (lr, momentum, weight_decay) =
            (self.group.lr, self.group.momentum, self.group.weight_decay);

        for param in self.group.params.clone() {
            let Some(grad) = param.grad() else {
                continue;
            };

            let grad = if weight_decay != 0.0 {
                let decay = session.mul_scalar(&param, weight_decay)?;
                session.add(&grad, &decay)?
            } else {
                grad
            };

            if momentum != 0.0 {
                let record = self.state.entry(param.id()).or_default();
                let buf = match record.iter().find(|(name, _)| name == "momentum") {
                    Some((_, buf)) => buf.clone(),
                    None => {
                        let buf = session.zeros(param.spec())?;
                        record.push(("momentum".to_string(), buf.clone()));
                        buf
                    }
                };
                session.mul_scalar_assign(&buf, momentum)?;
                session.add_assign(&buf, &grad)?;
                let update = session.mul_scalar(&buf, lr)?;
                session.sub_assign(&param, &update)?;
            } else {
                let update = session.mul_scalar(&grad, lr)?;
                session.sub_assign(&param, &update)?;
            }
        }
        Ok(())
    }
}
