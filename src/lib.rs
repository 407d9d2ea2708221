//! larder — a conversational smart-pantry agent.
//!
//! Converts free-form user utterances into dependency-ordered plans of
//! tool invocations, executes them with bounded parallelism, pauses for
//! user confirmation on ambiguous mutations, and streams per-task
//! progress to subscribed clients.

pub mod agent;
pub mod ambiguity;
pub mod api;
pub mod chain;
pub mod compose;
pub mod config;
pub mod confirmation;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod planner;
pub mod session;
pub mod stream;
pub mod tools;
pub mod types;
