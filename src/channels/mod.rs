//! Chat platform channels.

pub mod telegram;

pub use telegram::{MessageStream, TelegramChannel};
