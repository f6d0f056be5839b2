pub mod bot;
pub mod chatgpt;
pub mod commands;
pub mod config;
pub mod discord;
pub mod error;
pub mod moderation;
pub mod responder;
pub mod storage;

pub use bot::run;
