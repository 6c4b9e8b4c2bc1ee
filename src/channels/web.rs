//! Web channel — outbound messages go onto the task event stream, where
//! WebSocket clients connected to `/ws` pick them up.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::channels::{MessagingSurface, Reaction};
use crate::error::ChannelError;
use crate::tasks::TaskEvent;

pub struct WebChannel {
    events: broadcast::Sender<TaskEvent>,
}

impl WebChannel {
    pub fn new(events: broadcast::Sender<TaskEvent>) -> Self {
        Self { events }
    }

    fn publish(&self, event: TaskEvent) {
        // Ok if no clients are connected
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessagingSurface for WebChannel {
    fn name(&self) -> &str {
        "web"
    }

    async fn reply(&self, thread_id: &str, text: &str) -> Result<(), ChannelError> {
        self.publish(TaskEvent::Reply {
            thread_id: thread_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn react(&self, thread_id: &str, reaction: Reaction) -> Result<(), ChannelError> {
        self.publish(TaskEvent::Reaction {
            thread_id: thread_id.to_string(),
            reaction,
        });
        Ok(())
    }

    async fn upload(&self, thread_id: &str, path: &Path) -> Result<(), ChannelError> {
        self.publish(TaskEvent::Reply {
            thread_id: thread_id.to_string(),
            text: format!("📎 {}", path.display()),
        });
        Ok(())
    }
}
