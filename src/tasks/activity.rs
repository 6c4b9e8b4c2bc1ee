//! Task event stream — real-time updates on queue and execution activity.
//!
//! Events are broadcast by the scheduler, executor and inbox, and forwarded
//! to WebSocket clients connected at `/ws`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::channels::Reaction;

/// Default broadcast channel capacity.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events describing task lifecycle and outbound messaging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task entered the queue (new, clarified, or recovered).
    Queued { task_id: Uuid },
    /// Task is waiting on a clarification answer.
    Pending { task_id: Uuid, question: String },
    /// Task was claimed and execution began.
    Started { task_id: Uuid },
    Completed { task_id: Uuid, summary: String },
    /// Execution stopped and asked for more input.
    Waiting { task_id: Uuid, summary: String },
    Failed { task_id: Uuid, error: String },
    Rejected { task_id: Uuid },
    /// Task was found `running` at startup and reset.
    Recovered { task_id: Uuid },
    /// Outbound text posted to a thread (web surface).
    Reply { thread_id: String, text: String },
    /// Outbound status reaction on a thread (web surface).
    Reaction { thread_id: String, reaction: Reaction },
}

/// Create the shared event channel.
pub fn event_channel() -> broadcast::Sender<TaskEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
