//! Completion webhooks.

pub mod dispatcher;

pub use dispatcher::{CallbackDispatcher, DeliveryOutcome, backoff_delay};
