//! Control and observability core for a telephone voice-agent platform.
//!
//! This crate owns session lifecycle tracking, structured event emission
//! and querying, webhook ingestion from the telephony provider, the
//! per-call timing watchdog (processing-delay ack, silence reprompt/close,
//! max-duration guard), provider error classification, and the HTTP
//! control surface operators and the agent process talk to. STT/LLM/TTS
//! providers and the SIP/media bridge itself are external collaborators
//! reached only through the traits in [`telephony`].

pub mod config;
pub mod control_api;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod observer;
pub mod provider_errors;
pub mod session;
pub mod telephony;
pub mod webhook;

pub use config::Config;
pub use error::{CoreError, Result};
