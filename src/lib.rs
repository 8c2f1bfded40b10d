//! mail-triage: bank email triage over Gmail, LLM providers and Telegram.

pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod notify;
pub mod pipeline;
pub mod store;
