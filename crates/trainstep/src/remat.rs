//! Scoped rematerialization of optimizer state.
//!
//! The optimizer addresses its state by parameter identity while the graph
//! world is positional and value-based. This guard is the bidirectional
//! adapter between the two: on entry it saves the optimizer's bindings and
//! swaps in replacement parameters (and, optionally, replacement state keyed
//! by the *new* parameter identities); on every exit path it restores the
//! saved parameter list and merges the saved state back over the current
//! map, so nothing the scope created is lost and nothing it shadowed leaks.

use anyhow::{anyhow, Result};

use crate::flatten::{NamedCells, NamedStates};
use crate::optim::{Optimizer, StateMap};
use crate::tensor::{CellId, TensorCell};

/// RAII scope rebinding an optimizer's parameter group and state map.
pub struct RematerializedOptimizer<'a> {
    opt: &'a mut dyn Optimizer,
    saved_params: Vec<TensorCell>,
    saved_state: StateMap,
    merged_keys: Vec<CellId>,
}

impl<'a> RematerializedOptimizer<'a> {
    /// Enters the scope. `params` supplies the replacement parameter list by
    /// name; `named_states`, when present, is merged into the optimizer's
    /// state keyed by the matching replacement parameter's identity.
    pub fn enter(
        opt: &'a mut dyn Optimizer,
        named_states: Option<&NamedStates>,
        params: &NamedCells,
    ) -> Result<Self> {
        // Resolve every state entry against the replacement parameters
        // before touching the optimizer, so a bad mapping leaves it intact.
        let mut merges = Vec::new();
        if let Some(named_states) = named_states {
            for (name, record) in named_states {
                let param = params
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, cell)| cell)
                    .ok_or_else(|| {
                        anyhow!("state entry '{name}' has no matching replacement parameter")
                    })?;
                merges.push((param.id(), record.clone()));
            }
        }

        // Shallow save: record entries share cells with the live map, the
        // same way the bindings themselves are being saved.
        let saved_state = opt.state().clone();
        let merged_keys = merges.iter().map(|(id, _)| *id).collect();
        for (id, record) in merges {
            opt.state_mut().insert(id, record);
        }

        let group = opt.param_group_mut();
        let saved_params = std::mem::replace(
            &mut group.params,
            params.iter().map(|(_, cell)| cell.clone()).collect(),
        );

        Ok(RematerializedOptimizer {
            opt,
            saved_params,
            saved_state,
            merged_keys,
        })
    }

    /// The optimizer with replacements in place.
    pub fn optimizer(&mut self) -> &mut dyn Optimizer {
        self.opt
    }
}

impl Drop for RematerializedOptimizer<'_> {
    fn drop(&mut self) {
        self.opt.param_group_mut().params = std::mem::take(&mut self.saved_params);
        // Entries this scope merged in are withdrawn again (unless they
        // shadowed a saved entry, which the merge below restores). Entries
        // the body created on its own (warm-up state discovery) survive;
        // merge, don't replace.
        let saved = std::mem::take(&mut self.saved_state);
        for key in self.merged_keys.drain(..) {
            if !saved.contains_key(&key) {
                self.opt.state_mut().remove(&key);
            }
        }
        self.opt.state_mut().extend(saved);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use crate::graph::Session;
    use crate::optim::Sgd;
    use crate::tensor::{CellId, HostTensor, TensorCell};

    use super::*;

    fn scalar_cell(value: f32) -> TensorCell {
        TensorCell::real(HostTensor::scalar(value))
    }

    /// Snapshot of the optimizer's observable bindings: param ids plus, per
    /// state entry, the record's (name, cell id, value) triples.
    fn snapshot(opt: &dyn Optimizer) -> (Vec<CellId>, Vec<(CellId, Vec<(String, CellId, Vec<f32>)>)>) {
        let params = opt.param_group().params.iter().map(|p| p.id()).collect();
        let mut state: Vec<_> = opt
            .state()
            .iter()
            .map(|(id, record)| {
                (
                    *id,
                    record
                        .iter()
                        .map(|(name, cell)| {
                            (name.clone(), cell.id(), cell.to_host().unwrap().data().to_vec())
                        })
                        .collect(),
                )
            })
            .collect();
        state.sort_by_key(|(id, _)| *id);
        (params, state)
    }

    fn populated_optimizer() -> (Sgd, TensorCell) {
        let param = scalar_cell(1.0);
        let mut opt = Sgd::new(vec![param.clone()], 0.1);
        let mut session = Session::eager();
        param.set_grad(scalar_cell(2.0));
        opt.step(&mut session).unwrap();
        (opt, param)
    }

    #[test]
    fn scope_swaps_params_and_merges_state() {
        let (mut opt, original) = populated_optimizer();
        let replacement = scalar_cell(0.0);
        let states: NamedStates = vec![(
            "w".into(),
            vec![("momentum".into(), scalar_cell(0.5))],
        )];
        let params: NamedCells = vec![("w".into(), replacement.clone())];

        let mut scope = RematerializedOptimizer::enter(&mut opt, Some(&states), &params).unwrap();
        let inner = scope.optimizer();
        assert!(inner.param_group().params[0].same_cell(&replacement));
        assert!(inner.state().contains_key(&replacement.id()));
        drop(scope);

        assert!(opt.param_group().params[0].same_cell(&original));
        // The entry merged for the replacement parameter is withdrawn again.
        assert!(!opt.state().contains_key(&replacement.id()));
    }

    #[test]
    fn state_is_bit_identical_after_error_exit() {
        let (mut opt, _) = populated_optimizer();
        let before = snapshot(&opt);

        let body = |opt: &mut Sgd| -> Result<()> {
            let params: NamedCells = vec![("w".into(), scalar_cell(9.0))];
            let states: NamedStates = vec![(
                "w".into(),
                vec![("momentum".into(), scalar_cell(9.0))],
            )];
            let _scope = RematerializedOptimizer::enter(opt, Some(&states), &params)?;
            anyhow::bail!("body failed")
        };
        assert!(body(&mut opt).is_err());

        assert_eq!(snapshot(&opt), before);
    }

    #[test]
    fn state_is_bit_identical_after_panic_exit() {
        let (mut opt, _) = populated_optimizer();
        let before = snapshot(&opt);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let params: NamedCells = vec![("w".into(), scalar_cell(9.0))];
            let _scope = RematerializedOptimizer::enter(&mut opt, None, &params).unwrap();
            panic!("body failed");
        }));
        assert!(result.is_err());

        assert_eq!(snapshot(&opt), before);
    }

    #[test]
    fn entries_created_inside_the_scope_survive_exit() {
        let param = scalar_cell(1.0);
        let mut opt = Sgd::new(vec![param.clone()], 0.1);
        let fresh = scalar_cell(0.0);
        let params: NamedCells = vec![("w".into(), fresh.clone())];

        {
            let mut scope = RematerializedOptimizer::enter(&mut opt, None, &params).unwrap();
            let mut session = Session::eager();
            fresh.set_grad(scalar_cell(2.0));
            scope.optimizer().step(&mut session).unwrap();
        }
        // The warm-up pattern: state discovered inside the scope, keyed by
        // the replacement parameter, is still there afterwards.
        assert!(opt.state().contains_key(&fresh.id()));
        assert!(opt.param_group().params[0].same_cell(&param));
    }

    #[test]
    fn unknown_state_name_is_rejected() {
        let (mut opt, _) = populated_optimizer();
        let states: NamedStates = vec![(
            "nope".into(),
            vec![("momentum".into(), scalar_cell(0.0))],
        )];
        let params: NamedCells = vec![("w".into(), scalar_cell(0.0))];
        assert!(RematerializedOptimizer::enter(&mut opt, Some(&states), &params).is_err());
    }
}
