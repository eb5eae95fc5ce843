pub mod admission;
pub mod config;
pub mod consts;
pub mod divination;
pub mod error;
pub mod generative;
pub mod interpret;
pub mod persistence;
pub mod producer;
pub mod prompts;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod throttle;
pub mod worker;

pub use error::PipelineError;
