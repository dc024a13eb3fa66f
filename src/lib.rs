//! Chat router — rule-driven routing for inbound chat messages.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod prompts;
pub mod router;
pub mod rules;
