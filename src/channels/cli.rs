//! CLI channel — stdin/stdout surface for local use.
//!
//! Input syntax:
//! - `some request` starts a new thread
//! - `#<thread> text` replies in a thread
//! - `/reject <thread>` sends the negative-feedback gesture
//! - `/attach <path> text` starts a thread with an attachment

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::channels::{InboundEvent, InboundMessage, MessagingSurface, Reaction};
use crate::error::ChannelError;

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel {
    next_thread: AtomicU64,
}

impl CliChannel {
    pub fn new() -> Self {
        Self {
            next_thread: AtomicU64::new(1),
        }
    }

    /// Spawn the stdin reader. Events are delivered on the returned receiver
    /// until EOF.
    pub fn start(self: &Arc<Self>) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::clone(self);

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        match channel.parse_line(&line) {
                            Some(event) => {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            None => eprint!("> "),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Parse one input line into an event.
    fn parse_line(&self, line: &str) -> Option<InboundEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("/reject") {
            let thread_id = rest.trim();
            if thread_id.is_empty() {
                eprintln!("usage: /reject <thread>");
                return None;
            }
            return Some(InboundEvent::Rejection {
                thread_id: thread_id.to_string(),
            });
        }

        if let Some(rest) = line.strip_prefix("/attach ") {
            let (path, text) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            return Some(InboundEvent::Message(
                InboundMessage::new(self.new_thread_id(), text.trim())
                    .with_attachments(vec![path.to_string()]),
            ));
        }

        if let Some(rest) = line.strip_prefix('#') {
            let (thread_id, text) = rest.split_once(' ')?;
            if text.trim().is_empty() {
                return None;
            }
            return Some(InboundEvent::Message(InboundMessage::reply(
                thread_id,
                text.trim(),
            )));
        }

        Some(InboundEvent::Message(InboundMessage::new(
            self.new_thread_id(),
            line,
        )))
    }

    fn new_thread_id(&self) -> String {
        format!("cli-{}", self.next_thread.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingSurface for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn reply(&self, thread_id: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n[#{thread_id}] {text}\n");
        eprint!("> ");
        Ok(())
    }

    async fn react(&self, thread_id: &str, reaction: Reaction) -> Result<(), ChannelError> {
        eprintln!("{} #{} {:?}", reaction.emoji(), thread_id, reaction);
        Ok(())
    }

    async fn upload(&self, thread_id: &str, path: &Path) -> Result<(), ChannelError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "cli".into(),
                reason: format!("{}: {e}", path.display()),
            })?;
        println!("[#{thread_id}] 📎 {} ({} bytes)", path.display(), meta.len());
        Ok(())
    }
}
