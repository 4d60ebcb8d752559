//! Durable tool-calling loop that answers data questions with an LLM.
//!
//! A question becomes a [`WorkflowRun`](core::workflow::WorkflowRun): the
//! model is asked, the tools it calls are run against SQL, Cypher and
//! documentation backends, and the conversation is checkpointed after every
//! round so another replica can pick the run up if this one dies.

pub mod core;
pub mod logging;

pub use crate::core::config::EngineConfig;
pub use crate::core::workflow::{ProgressEvent, ProgressSink, RunError, RunOptions, Runner};
