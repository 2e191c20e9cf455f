pub mod agent;
pub mod character;
pub mod config;
pub mod database;
pub mod llm_client;
pub mod memory;
pub mod prompts;
pub mod runtime;
pub mod telegram;
