//! Compiles a whole training step (forward, gradients, optimizer update)
//! into one side-effect-free computation graph, and optionally expands that
//! graph for SPMD execution across a logical device grid.

pub mod compile;
mod env;
pub mod error;
pub mod flatten;
pub mod graph;
pub mod module;
pub mod optim;
pub mod passes;
pub mod registry;
pub mod remat;
pub mod spmd;
pub mod tensor;

pub use compile::{CompiledTrainStep, StepOutput, StepProgram, TrainStepCompiler};
pub use error::CompileError;
pub use graph::{Graph, GraphExecutor, Interpreter, Op, Session, ValueId};
pub use module::Module;
pub use optim::{Optimizer, Sgd};
pub use tensor::{
    DType, Device, FakeMode, FakeTensor, HostTensor, Shape, TensorCell, TensorSpec, TensorValue,
};
