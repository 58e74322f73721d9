pub mod event;
pub mod openai_chat;
