//! SMS transport implementations for the EMA engine.
//!
//! The engine only sees [`ema_core::traits::SmsTransport`]; this crate
//! provides the concrete clients.

pub mod twilio;

pub use twilio::TwilioTransport;
