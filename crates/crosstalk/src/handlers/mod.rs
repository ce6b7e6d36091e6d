//! HTTP request handlers.

mod chat;
mod health;
mod version;

pub use chat::chat_completions;
pub use health::{livez, readyz};
pub use version::version;
