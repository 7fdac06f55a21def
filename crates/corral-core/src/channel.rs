//! Outbound chat seam
//!
//! The real chat client lives outside this crate; the supervisor only needs to
//! send text to a room and toggle a typing indicator.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Best-effort; implementations may ignore it
    async fn set_typing(&self, _chat_id: &str, _typing: bool) -> Result<()> {
        Ok(())
    }
}

/// Writes outbound messages to the log instead of a chat network
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl ChatChannel for LogChannel {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        info!("[{}] {}", chat_id, text);
        Ok(())
    }

    async fn set_typing(&self, chat_id: &str, typing: bool) -> Result<()> {
        debug!("[{}] typing={}", chat_id, typing);
        Ok(())
    }
}
