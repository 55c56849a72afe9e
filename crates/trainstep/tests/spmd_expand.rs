//! Distributed expansion over compiled train steps: placement invariants,
//! override handling, and hard failures.

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;

use trainstep::registry;
use trainstep::spmd::{FallbackExpansion, ParallelMode, Placement, StepArg};
use trainstep::{
    CompileError, CompiledTrainStep, FakeMode, HostTensor, Module, Op, Optimizer, Session, Sgd,
    Shape, StepOutput, TensorCell,
};

const BATCH: usize = 4;
const FEATURES: usize = 3;

fn regression_step(
    session: &mut Session,
    module: &Module,
    optimizer: &mut dyn Optimizer,
    x: &TensorCell,
    y: &TensorCell,
) -> anyhow::Result<TensorCell> {
    let w = module.get("w").context("module is missing 'w'")?;
    let pred = session.matmul(x, &w)?;
    let diff = session.sub(&pred, y)?;
    let sq = session.mul(&diff, &diff)?;
    let loss = session.mean(&sq)?;

    let grad_pred = session.mul_scalar(&diff, 2.0 / BATCH as f32)?;
    let xt = session.transpose(x)?;
    let grad_w = session.matmul(&xt, &grad_pred)?;
    w.set_grad(grad_w);

    optimizer.step(session)?;
    Ok(loss)
}

/// Plain regression step over (x, y).
fn basic_body(
    session: &mut Session,
    module: &Module,
    optimizer: &mut dyn Optimizer,
    args: &[TensorCell],
) -> anyhow::Result<StepOutput> {
    let loss = regression_step(session, module, optimizer, &args[0], &args[1])?;
    Ok(StepOutput::Tensors(vec![loss]))
}

/// Regression step with a scalar loss offset as a third runtime argument.
fn offset_body(
    session: &mut Session,
    module: &Module,
    optimizer: &mut dyn Optimizer,
    args: &[TensorCell],
) -> anyhow::Result<StepOutput> {
    let loss = regression_step(session, module, optimizer, &args[0], &args[1])?;
    let loss = session.add(&loss, &args[2])?;
    Ok(StepOutput::Tensors(vec![loss]))
}

struct Compiled {
    compiled: CompiledTrainStep,
    args: Vec<TensorCell>,
}

fn compile_step(with_offset: bool) -> Compiled {
    let mut rng = StdRng::seed_from_u64(21);
    let mut module = Module::new();
    module
        .register_parameter(
            "w",
            HostTensor::rand_uniform(Shape::new([FEATURES, 1]), &mut rng),
        )
        .unwrap();
    module
        .register_buffer("feature_scale", HostTensor::scalar(1.0))
        .unwrap();
    let mut optimizer = Sgd::new(
        module
            .named_parameters()
            .into_iter()
            .map(|(_, cell)| cell)
            .collect(),
        0.1,
    );

    let mut tensors = vec![
        HostTensor::rand_uniform(Shape::new([BATCH, FEATURES]), &mut rng),
        HostTensor::rand_uniform(Shape::new([BATCH, 1]), &mut rng),
    ];
    if with_offset {
        tensors.push(HostTensor::scalar(0.0));
    }

    registry::register_default_backends();
    let compiler = registry::lookup_compiler("train_step_eager").unwrap();
    let mode = FakeMode::new();
    let inputs: Vec<_> = tensors.iter().map(|t| mode.from_tensor(t)).collect();
    let compiled = if with_offset {
        compiler.compile(&mut module, &mut optimizer, &offset_body, &inputs)
    } else {
        compiler.compile(&mut module, &mut optimizer, &basic_body, &inputs)
    }
    .unwrap();
    let args = tensors.into_iter().map(TensorCell::real).collect();
    Compiled { compiled, args }
}

fn step_args(args: &[TensorCell]) -> Vec<StepArg> {
    args.iter().cloned().map(StepArg::Tensor).collect()
}

#[test]
fn fallback_expansion_replicates_state_and_shards_args() {
    let Compiled { compiled, args } = compile_step(false);
    let strategy = FallbackExpansion::new(2);
    let expanded = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &step_args(&args),
            &[],
        )
        .unwrap();

    let schemas = expanded.input_schemas().expect("expansion attaches schemas");
    // P (w, feature_scale) + S (momentum) + A (x, y), position for position.
    assert_eq!(schemas.len(), compiled.graph().input_count());
    assert_eq!(schemas.len(), 5);
    for schema in &schemas[..3] {
        assert_eq!(schema.placement(), Placement::Replicate);
    }
    assert_eq!(schemas[3].placement(), Placement::Shard(0));
    assert_eq!(schemas[4].placement(), Placement::Shard(0));

    // Local input specs are the per-device shards.
    let x_slot = expanded.inputs()[3];
    assert_eq!(
        expanded.spec_of(x_slot).unwrap().shape.dims(),
        &[BATCH / 2, FEATURES]
    );
}

#[test]
fn expanded_graph_contains_redistribution() {
    let Compiled { compiled, args } = compile_step(false);
    let strategy = FallbackExpansion::new(2);
    let expanded = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &step_args(&args),
            &[],
        )
        .unwrap();

    // The sharded loss reduction turns into local-reduce + all_reduce, and
    // the gradient matmul over sharded operands gathers first.
    assert!(expanded
        .nodes()
        .iter()
        .any(|n| matches!(n.op, Op::AllReduce { .. })));
    assert!(expanded
        .nodes()
        .iter()
        .any(|n| matches!(n.op, Op::AllGather { .. })));
    // The copy-back epilogue survives expansion.
    assert!(expanded.nodes().iter().any(|n| n.op == Op::CopyInto));
}

#[test]
fn placement_override_is_honored_by_identity() {
    let Compiled { compiled, args } = compile_step(true);
    let mut strategy = FallbackExpansion::new(2);
    strategy.override_placement(&args[2], vec![Placement::Replicate]);
    let expanded = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &step_args(&args),
            &[],
        )
        .unwrap();

    let schemas = expanded.input_schemas().unwrap();
    assert_eq!(schemas.len(), 6);
    assert_eq!(schemas[5].placement(), Placement::Replicate);
}

#[test]
fn sharding_a_scalar_argument_fails_hard() {
    let Compiled { compiled, args } = compile_step(true);
    // Without an override the scalar offset takes the default shard-on-0
    // placement, which cannot be realized for a 0-dimensional tensor.
    let strategy = FallbackExpansion::new(2);
    let err = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &step_args(&args),
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::PlacementConversion(_)));
}

#[test]
fn incompatible_override_fails_hard() {
    let Compiled { compiled, args } = compile_step(false);
    let mut strategy = FallbackExpansion::new(2);
    // y is [BATCH, 1]; dimension 1 does not divide across two devices.
    strategy.override_placement(&args[1], vec![Placement::Shard(1)]);
    let err = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &step_args(&args),
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::PlacementConversion(_)));
}

#[test]
fn kwargs_follow_positional_arguments() {
    let Compiled { compiled, args } = compile_step(true);
    let mut strategy = FallbackExpansion::new(2);
    strategy.override_placement(&args[2], vec![Placement::Replicate]);
    let positional = step_args(&args[..2]);
    let keyword = vec![("offset".to_string(), StepArg::Tensor(args[2].clone()))];
    let expanded = strategy
        .expand(
            compiled.graph().clone(),
            compiled.params_and_buffers(),
            compiled.named_states(),
            &positional,
            &keyword,
        )
        .unwrap();
    let schemas = expanded.input_schemas().unwrap();
    assert_eq!(schemas.len(), 6);
    assert_eq!(schemas[5].placement(), Placement::Replicate);
}
