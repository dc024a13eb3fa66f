//! Message processing pipeline.
//!
//! Every inbound message flows through:
//! 1. Channel adapter — platform-specific I/O into `InboundMessage`
//! 2. `MessageProcessor::handle_message()` — commands, language gate, memory
//! 3. `DecisionResolver::resolve()` — rule matching into one decision
//! 4. `ActionDispatcher::dispatch()` — drop, forward or reply

pub mod processor;
pub mod types;

pub use processor::{MessageProcessor, ProcessOutcome};
