pub mod history;
pub mod loop_;

pub use history::{prune, to_chat_messages, trim, HistoryError, UiMessage, UiPart, SYSTEM_PROMPT};
pub use loop_::{agent_turn, AgentEvent, RunSettings};
