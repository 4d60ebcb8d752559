pub mod checkpoint;
pub mod claim;
pub mod config;
pub mod llm;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod terminal;
pub mod tools;
pub mod workflow;
