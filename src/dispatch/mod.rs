//! Outbound delivery of scheduled replies.

mod logging;
mod slack;

pub use logging::LogDispatcher;
pub use slack::SlackDispatcher;

use async_trait::async_trait;

use crate::error::DispatchError;

/// Sends reply text into a channel, optionally into a thread.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<(), DispatchError>;
}
