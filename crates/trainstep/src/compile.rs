//! The training-step compiler.
//!
//! A full train step (forward, gradient computation, optimizer update) is
//! compiled into one side-effect-free graph in four stages:
//!
//! 1. **Warm-up**: run the step once over shape-only placeholders so the
//!    optimizer materializes its state structure, then replace every
//!    placeholder state leaf with a real zero tensor.
//! 2. **Full trace**: trace a functional wrapper over the concatenation of
//!    (parameters, optimizer state, runtime arguments), with the module
//!    rebound and the optimizer rematerialized onto trace placeholders, so
//!    every operation including in-place updates lands in one graph.
//! 3. **Functionalize**: rewrite mutation into pure ops plus a copy-back
//!    epilogue.
//! 4. **Restore the calling convention**: return a callable taking only the
//!    original runtime arguments, closing over the real parameter and state
//!    sequences; each call advances them in place through the epilogue.
//!
//! All stages run to completion in order; a failure at any point aborts the
//! attempt and never yields a partial graph.

use std::sync::Arc;

use tracing::{debug, info};

use crate::env;
use crate::error::{CompileError, CompileResult};
use crate::flatten::{
    flatten, named_tree, states_tree, tree_to_named, tree_to_states, unflatten, NamedCells,
    NamedStates, Tree,
};
use crate::graph::{Graph, GraphExecutor, Session};
use crate::module::{fakeify_named, Module, ReboundModule};
use crate::optim::Optimizer;
use crate::passes;
use crate::remat::RematerializedOptimizer;
use crate::tensor::{FakeTensor, HostTensor, TensorCell, TensorValue};

/// What a step body hands back. Only a flat sequence compiles; the other
/// shapes exist so that the contract is checkable rather than implicit.
pub enum StepOutput {
    /// A flat sequence of tensors. The only accepted form.
    Tensors(Vec<TensorCell>),
    /// A single bare tensor; rejected with [`CompileError::OutputShape`].
    Tensor(TensorCell),
    /// An arbitrarily nested structure; rejected likewise.
    Tree(Tree<TensorCell>),
}

/// A captured training-step program, replayable under any evaluation
/// session. This is the seam to the imperative-capture front-end: whatever
/// captured the user's step hands the pipeline one of these.
pub trait StepProgram {
    fn run(
        &self,
        session: &mut Session,
        module: &Module,
        optimizer: &mut dyn Optimizer,
        args: &[TensorCell],
    ) -> anyhow::Result<StepOutput>;
}

impl<F> StepProgram for F
where
    F: Fn(
        &mut Session,
        &Module,
        &mut dyn Optimizer,
        &[TensorCell],
    ) -> anyhow::Result<StepOutput>,
{
    fn run(
        &self,
        session: &mut Session,
        module: &Module,
        optimizer: &mut dyn Optimizer,
        args: &[TensorCell],
    ) -> anyhow::Result<StepOutput> {
        self(session, module, optimizer, args)
    }
}

fn expect_flat(output: StepOutput) -> CompileResult<Vec<TensorCell>> {
    match output {
        StepOutput::Tensors(cells) => Ok(cells),
        StepOutput::Tensor(_) | StepOutput::Tree(_) => Err(CompileError::OutputShape),
    }
}

/// Compiles full training steps against a named graph-level executor.
pub struct TrainStepCompiler {
    executor: Arc<dyn GraphExecutor>,
}

impl TrainStepCompiler {
    pub fn new(executor: Arc<dyn GraphExecutor>) -> Self {
        TrainStepCompiler { executor }
    }

    /// Compiles `program` into a callable over the original runtime
    /// arguments. `sample_inputs` are shape-only stand-ins for those
    /// arguments and must share one shape-inference context.
    pub fn compile(
        &self,
        module: &mut Module,
        optimizer: &mut dyn Optimizer,
        program: &dyn StepProgram,
        sample_inputs: &[FakeTensor],
    ) -> CompileResult<CompiledTrainStep> {
        // Preconditions: fatal before any tracing begins.
        let Some(first) = sample_inputs.first() else {
            return Err(CompileError::Precondition(
                "expected at least one sample input".to_string(),
            ));
        };
        let fake_mode = Arc::clone(first.mode());
        if sample_inputs
            .iter()
            .any(|fake| fake.mode().id() != fake_mode.id())
        {
            return Err(CompileError::Precondition(
                "sample inputs must share one shape-inference context".to_string(),
            ));
        }
        let named = module.named_params_and_buffers();
        for (name, cell) in &named {
            if !cell.is_real() {
                return Err(CompileError::Precondition(format!(
                    "parameter '{name}' must be a real tensor before compilation"
                )));
            }
        }

        let (params_flat, params_spec) = flatten(&named_tree(&named));
        let fake_named = fakeify_named(&fake_mode, &named)?;
        let fake_args: Vec<TensorCell> = sample_inputs
            .iter()
            .map(|fake| TensorCell::fake(fake.clone()))
            .collect();

        // Stage 1: warm-up. The optimizer state map is empty until a step
        // has run; one shape-only pass materializes its keys and shapes.
        debug!("warm-up: discovering optimizer state structure");
        {
            let _permissive = fake_mode.allow_non_fake_scope();
            let mut session = Session::shape(Arc::clone(&fake_mode));
            let rebound = ReboundModule::enter(module, &fake_named)?;
            let mut remat = RematerializedOptimizer::enter(optimizer, None, &fake_named)?;
            let output =
                program.run(&mut session, rebound.module(), remat.optimizer(), &fake_args)?;
            expect_flat(output)?;
        }

        // The state map now holds placeholder leaves keyed by the fakeified
        // parameters. Replace each leaf with a real zero tensor of the same
        // spec. A real leaf that is not all-zero breaks the zero-init
        // contract and is rejected (unless the guard is disabled).
        for record in optimizer.state_mut().values_mut() {
            for (state_name, cell) in record.iter_mut() {
                let replacement = match &*cell.borrow() {
                    TensorValue::Fake(fake) => HostTensor::zeros(fake.spec().clone()),
                    TensorValue::Real(tensor) => {
                        if env::check_zero_init() && !tensor.is_all_zero() {
                            return Err(CompileError::UnsupportedOptimizerState {
                                name: state_name.clone(),
                            });
                        }
                        HostTensor::zeros(tensor.spec().clone())
                    }
                    TensorValue::Traced { .. } => {
                        return Err(CompileError::Execution(anyhow::anyhow!(
                            "trace value leaked into warm-up state"
                        )))
                    }
                };
                cell.set(TensorValue::Real(replacement));
            }
        }

        // Match the fakeified parameters back against the state map to name
        // each state record, then flatten states the same way as params.
        let mut named_states: NamedStates = Vec::new();
        for (name, fake_cell) in &fake_named {
            if let Some(record) = optimizer.state().get(&fake_cell.id()) {
                named_states.push((name.clone(), record.clone()));
            }
        }
        let (states_flat, states_spec) = flatten(&states_tree(&named_states));
        info!(
            params = params_flat.len(),
            states = states_flat.len(),
            "warm-up complete"
        );

        // Stage 2: trace the full graph. Inputs are exactly the
        // concatenation (params, states, args), in flattening order.
        let mut session = Session::trace();
        let traced_params: Vec<TensorCell> = params_flat
            .iter()
            .map(|cell| session.input(cell.spec()))
            .collect::<anyhow::Result<_>>()?;
        let traced_states: Vec<TensorCell> = states_flat
            .iter()
            .map(|cell| session.input(cell.spec()))
            .collect::<anyhow::Result<_>>()?;
        let traced_args: Vec<TensorCell> = sample_inputs
            .iter()
            .map(|fake| session.input(fake.spec().clone()))
            .collect::<anyhow::Result<_>>()?;

        let traced_named = tree_to_named(unflatten(traced_params, &params_spec)?)?;
        let traced_named_states = tree_to_states(unflatten(traced_states, &states_spec)?)?;

        let outputs = {
            let rebound = ReboundModule::enter(module, &traced_named)?;
            let mut remat = RematerializedOptimizer::enter(
                optimizer,
                Some(&traced_named_states),
                &traced_named,
            )?;
            let output =
                program.run(&mut session, rebound.module(), remat.optimizer(), &traced_args)?;
            expect_flat(output)?
        };
        let graph = session.finish(&outputs)?;
        debug!(graph = %graph, "traced graph");

        // Stage 3: functionalize. Runs with no gradient bookkeeping;
        // gradients were already captured as ordinary nodes.
        let graph = passes::functionalize(graph)?;
        debug!(graph = %graph, "functionalized graph");
        info!(
            inputs = graph.input_count(),
            nodes = graph.nodes().len(),
            outputs = graph.outputs().len(),
            "train step compiled"
        );

        // Stage 4: restore the calling convention by closing over the real
        // parameter and state sequences.
        Ok(CompiledTrainStep {
            graph,
            params: params_flat,
            states: states_flat,
            named,
            named_states,
            executor: Arc::clone(&self.executor),
        })
    }
}

/// The compiled step: a callable over the original runtime arguments.
///
/// Parameter and state cells are closed over; every call advances them in
/// place through the graph's copy-back epilogue, matching repeated optimizer
/// steps. Calls fully serialize with each other through those cells;
/// concurrent invocation is not supported and must be serialized externally.
pub struct CompiledTrainStep {
    graph: Graph,
    params: Vec<TensorCell>,
    states: Vec<TensorCell>,
    named: NamedCells,
    named_states: NamedStates,
    executor: Arc<dyn GraphExecutor>,
}

impl std::fmt::Debug for CompiledTrainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTrainStep")
            .field("graph", &self.graph)
            .field("params", &self.params)
            .field("states", &self.states)
            .field("named", &self.named)
            .field("named_states", &self.named_states)
            .finish_non_exhaustive()
    }
}

impl CompiledTrainStep {
    /// Runs one training step. No gradient-tracking context exists here: the
    /// graph already encodes the update rule.
    pub fn call(&self, args: &[HostTensor]) -> CompileResult<Vec<HostTensor>> {
        let mut inputs: Vec<TensorCell> =
            Vec::with_capacity(self.params.len() + self.states.len() + args.len());
        inputs.extend(self.params.iter().cloned());
        inputs.extend(self.states.iter().cloned());
        inputs.extend(args.iter().cloned().map(TensorCell::real));
        if inputs.len() != self.graph.input_count() {
            return Err(CompileError::Precondition(format!(
                "compiled step expects {} runtime arguments, got {}",
                self.graph.input_count() - self.params.len() - self.states.len(),
                args.len()
            )));
        }
        self.executor.run(&self.graph, &inputs)
    }

    /// The functionalized single-device graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Parameters and buffers by name, sharing cells with the live module.
    pub fn params_and_buffers(&self) -> &NamedCells {
        &self.named
    }

    /// Optimizer state by parameter name.
    pub fn named_states(&self) -> &NamedStates {
        &self.named_states
    }
}
