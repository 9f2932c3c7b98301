//! agentflow - Dependency-aware scheduler that runs a plan of tasks through a
//! coding agent, dispatching each task as soon as its dependencies are done

pub mod cli;
pub mod dag;
pub mod error;
pub mod executors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod observer;
pub mod parser;
pub mod recovery;
pub mod scheduler;
pub mod settings;
pub mod store;
