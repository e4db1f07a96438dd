//! Interfaces between the ember core and its external collaborators
//!
//! The forward pass ([`ModelExecutor`]) and token selection ([`Sampler`]) are
//! supplied from outside; the scheduler and backend talk to them only through
//! the types in this crate.

pub mod batch;
pub mod model_executor;
pub mod sampler;
pub mod testing;

pub use batch::{
    AdmittedRequest, Batch, BatchEntry, PrefilledState, RequestStepResult, StepKind, StepReport,
};
pub use model_executor::{
    ExecutionMode, ExecutorOutput, ModelExecutor, SequenceInput, StepDescriptor,
};
pub use sampler::{
    apply_penalties, mask_eos, softmax, GreedySampler, MultinomialSampler, SampleOutput, Sampler,
    SamplingRequest,
};
pub use testing::{pattern_vector, ScriptedExecutor};
