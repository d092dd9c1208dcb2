//! Discord adapter: a single bot identity relayed through the gateway.
//!
//! Unlike Telegram / WhatsApp there is no session lifecycle here: the bot
//! token is the only credential and nothing is coordinated through the data
//! directory.

pub mod gateway;
pub mod ingest;
pub mod rest;
pub mod worker;

pub use rest::{BotUser, DiscordReplies, DiscordRest};
pub use worker::run;
