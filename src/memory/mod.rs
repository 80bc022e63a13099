//! 记忆层：LLM 消息、智能体有界记忆、黑板

pub mod agent_memory;
pub mod blackboard;
pub mod message;

pub use agent_memory::{Memory, MemoryItem};
pub use blackboard::Blackboard;
pub use message::{Message, Role};
