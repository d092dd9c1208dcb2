//! Telegram adapter: MTProto user-account login (phone + code) and the
//! message relay loop.

pub mod auth;
pub mod ingest;
pub mod worker;

pub use auth::TelegramAuth;
pub use worker::run_worker;
