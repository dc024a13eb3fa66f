//! Turning decisions into effects: replies, forwards, generated answers.

pub mod answer;
pub mod dispatcher;

pub use answer::{AnswerAssembler, AnswerRequest};
pub use dispatcher::{ActionDispatcher, Apology, DispatchOutcome};
