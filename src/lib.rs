//! Inbox Assist — durable task queue and bounded execution engine for
//! agent tasks received over a chat surface.

pub mod agent;
pub mod api;
pub mod artifacts;
pub mod channels;
pub mod classifier;
pub mod config;
pub mod error;
pub mod inbox;
pub mod store;
pub mod tasks;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
