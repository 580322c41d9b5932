//! Admission queue, the sequential worker and startup recovery.

pub mod recovery;
pub mod task_queue;
pub mod worker;

pub use recovery::reconcile_on_startup;
pub use task_queue::TaskQueue;
pub use worker::{Worker, spawn_worker};
