//! Core session lifecycle and authentication logic for BotEngine.
//!
//! This crate is platform-agnostic. Telegram / WhatsApp / OpenAI / phishing API
//! live behind ports (traits) implemented in adapter crates; the control panel
//! and the workers only meet through the signal files in the data directory.

pub mod agent;
pub mod config;
pub mod control;
pub mod domain;
pub mod errors;
pub mod handshake;
pub mod logging;
pub mod ports;
pub mod process;
pub mod registry;
pub mod relay;
pub mod signals;
pub mod supervisor;
pub mod utils;

pub use errors::{Error, Result};
