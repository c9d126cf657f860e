mod chat;

pub use chat::{LlmClient, LlmConfig, LlmError, LlmMessage};
