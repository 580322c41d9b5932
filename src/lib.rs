//! Task Relay — durable single-worker automation queue with webhooks.

pub mod api;
pub mod callback;
pub mod config;
pub mod error;
pub mod executor;
pub mod queue;
pub mod store;
pub mod tasks;
