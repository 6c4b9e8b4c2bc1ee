//! Tasks — data model, state machine, and event stream.

pub mod activity;
pub mod model;

pub use activity::{TaskEvent, event_channel};
pub use model::{Classification, Task, TaskPatch, TaskStatus, append_clarification};
