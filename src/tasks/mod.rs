//! Task records and their lifecycle.

pub mod model;
pub mod state;

pub use model::{
    CallbackPayload, Parameters, RESTART_FAILURE_REASON, Submission, Task, TaskId, TaskPage,
    TaskSpec,
};
pub use state::{TaskStatus, TaskTransition};
