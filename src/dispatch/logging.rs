use async_trait::async_trait;
use tracing::info;

use super::Dispatcher;
use crate::error::DispatchError;

/// Dispatcher that only logs. Used when no chat token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn send(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<(), DispatchError> {
        info!(
            channel_id,
            thread_id = thread_id.unwrap_or("-"),
            text,
            "Reply (log only)"
        );
        Ok(())
    }
}
