//! Named parameter/buffer containers and scoped parameter rebinding.

use anyhow::{ensure, Result};

use crate::flatten::NamedCells;
use crate::tensor::{HostTensor, TensorCell, TensorValue};

fn validate_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "parameter names must be non-empty");
    ensure!(
        name.is_ascii(),
        "parameter names must be ASCII, got '{name}'"
    );
    Ok(())
}

/// A container of named parameters and buffers, in registration order.
/// Dotted names (`"encoder.weight"`) address nested structure.
#[derive(Default)]
pub struct Module {
    params: NamedCells,
    buffers: NamedCells,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    fn register(list: &mut NamedCells, other: &NamedCells, name: &str, t: HostTensor) -> Result<TensorCell> {
        validate_name(name)?;
        ensure!(
            !list.iter().chain(other.iter()).any(|(n, _)| n == name),
            "duplicate parameter name '{name}'"
        );
        let cell = TensorCell::real(t);
        list.push((name.to_string(), cell.clone()));
        Ok(cell)
    }

    /// Registers a trainable parameter, returning its cell.
    pub fn register_parameter(&mut self, name: &str, t: HostTensor) -> Result<TensorCell> {
        Self::register(&mut self.params, &self.buffers, name, t)
    }

    /// Registers a non-trainable buffer, returning its cell.
    pub fn register_buffer(&mut self, name: &str, t: HostTensor) -> Result<TensorCell> {
        Self::register(&mut self.buffers, &self.params, name, t)
    }

    /// Looks up a parameter or buffer by name.
    pub fn get(&self, name: &str) -> Option<TensorCell> {
        self.params
            .iter()
            .chain(self.buffers.iter())
            .find(|(n, _)| n == name)
            .map(|(_, cell)| cell.clone())
    }

    /// Trainable parameters only, in registration order.
    pub fn named_parameters(&self) -> NamedCells {
        self.params.clone()
    }

    /// Parameters followed by buffers, in registration order. This is the
    /// flattening order the whole pipeline keys on.
    pub fn named_params_and_buffers(&self) -> NamedCells {
        let mut all = self.params.clone();
        all.extend(self.buffers.iter().cloned());
        all
    }
}

/// Scoped rebinding of a module's parameters and buffers.
///
/// On entry every named cell in the module is swapped for the replacement of
/// the same name; on every exit path (including panics) the original cells
/// are restored. The replacement mapping must cover the module exactly.
pub struct ReboundModule<'a> {
    module: &'a mut Module,
    saved: Vec<TensorCell>,
}

impl<'a> ReboundModule<'a> {
    pub fn enter(module: &'a mut Module, replacements: &NamedCells) -> Result<Self> {
        let total = module.params.len() + module.buffers.len();
        ensure!(
            replacements.len() == total,
            "rebinding expects {total} entries, got {}",
            replacements.len()
        );
        for (name, _) in module.params.iter().chain(module.buffers.iter()) {
            ensure!(
                replacements.iter().any(|(n, _)| n == name),
                "rebinding is missing an entry for '{name}'"
            );
        }
        let mut saved = Vec::with_capacity(total);
        for (slot_name, slot) in module.params.iter_mut().chain(module.buffers.iter_mut()) {
            let replacement = replacements
                .iter()
                .find(|(n, _)| n == slot_name)
                .map(|(_, cell)| cell.clone())
                .expect("coverage checked above");
            saved.push(std::mem::replace(slot, replacement));
        }
        Ok(ReboundModule { module, saved })
    }

    /// The module with replacements in place.
    pub fn module(&self) -> &Module {
        self.module
    }
}

impl Drop for ReboundModule<'_> {
    fn drop(&mut self) {
        for ((_, slot), original) in self
            .module
            .params
            .iter_mut()
            .chain(self.module.buffers.iter_mut())
            .zip(self.saved.drain(..))
        {
            *slot = original;
        }
    }
}

impl std::ops::Deref for ReboundModule<'_> {
    type Target = Module;

    fn deref(&self) -> &Module {
        self.module
    }
}

/// Fakeifies a named mapping into fresh cells holding placeholders.
pub fn fakeify_named(
    mode: &std::sync::Arc<crate::tensor::FakeMode>,
    named: &NamedCells,
) -> Result<NamedCells> {
    named
        .iter()
        .map(|(name, cell)| {
            let spec = cell.spec();
            ensure!(
                cell.is_real(),
                "cannot fakeify '{name}': expected a real tensor"
            );
            Ok((
                name.clone(),
                TensorCell::new(TensorValue::Fake(mode.from_spec(spec))),
            ))
        })
        .collect()
}
