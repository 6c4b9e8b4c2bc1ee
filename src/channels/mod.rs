//! Messaging surface abstraction — inbound events and outbound replies.

pub mod cli;
pub mod web;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

pub use cli::CliChannel;
pub use web::WebChannel;

/// Status signal shown on a task's originating message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    /// Message was accepted as a task.
    Accepted,
    /// Task is executing.
    Working,
    Completed,
    /// Task stopped and needs more input.
    Waiting,
    Failed,
    Rejected,
}

impl Reaction {
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Accepted => "👀",
            Self::Working => "⏳",
            Self::Completed => "✅",
            Self::Waiting => "❓",
            Self::Failed => "❌",
            Self::Rejected => "🚫",
        }
    }
}

/// A message received from the surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable thread identifier.
    pub thread_id: String,
    pub text: String,
    /// `true` when the message is a reply inside an existing thread.
    #[serde(default)]
    pub is_reply: bool,
    /// Local paths of attached files.
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl InboundMessage {
    /// A top-level message that starts a new thread.
    pub fn new(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            text: text.into(),
            is_reply: false,
            attachments: Vec::new(),
        }
    }

    /// A reply inside an existing thread.
    pub fn reply(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            is_reply: true,
            ..Self::new(thread_id, text)
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Anything the surface can deliver to the inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// Negative-feedback gesture on a thread's task.
    Rejection { thread_id: String },
}

/// Outbound side of a chat surface.
#[async_trait]
pub trait MessagingSurface: Send + Sync {
    /// Surface name for logs.
    fn name(&self) -> &str;

    /// Post text into a thread.
    async fn reply(&self, thread_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Set a status reaction on the thread's root message.
    async fn react(&self, thread_id: &str, reaction: Reaction) -> Result<(), ChannelError>;

    /// Upload a produced file into a thread.
    async fn upload(&self, thread_id: &str, path: &Path) -> Result<(), ChannelError>;
}

/// Truncate text for display, respecting char boundaries.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
