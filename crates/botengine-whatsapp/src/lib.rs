//! WhatsApp adapter.
//!
//! WhatsApp Web is driven by a bridge child process that speaks NDJSON over
//! stdio; this crate owns that process, renders its QR challenges and relays
//! its messages.

pub mod bridge;
pub mod ingest;
pub mod notify;
pub mod qr;
pub mod worker;

pub use bridge::{Bridge, BridgeEvent, BridgeMessage};
pub use worker::run_worker;
