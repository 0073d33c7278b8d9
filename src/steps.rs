//! Built-in step kinds

pub mod agent;
pub mod branching;
pub mod complete;
pub mod constant;
pub mod flow;
pub mod map;
pub mod message;
pub mod retry;
pub mod tool;

pub use agent::AgentExecutionStep;
pub use branching::{BranchingStep, NEXT_STEP_NAME};
pub use complete::CompleteStep;
pub use constant::ConstantValuesStep;
pub use flow::FlowExecutionStep;
pub use map::{MapStep, MapStepBuilder, ITERATED_INPUT};
pub use message::{InputMessageStep, OutputMessageStep, OUTPUT_MESSAGE, USER_PROVIDED_INPUT};
pub use retry::{RetryStep, RETRY_COUNT, SUCCESS};
pub use tool::ToolExecutionStep;
