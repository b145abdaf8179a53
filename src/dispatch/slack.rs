//! Slack Web API dispatcher (`chat.postMessage`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::Dispatcher;
use crate::error::{ConfigError, DispatchError};

const DEFAULT_API_BASE: &str = "https://slack.com/api";

pub struct SlackDispatcher {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl SlackDispatcher {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// `None` when `SLACK_BOT_TOKEN` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var("SLACK_BOT_TOKEN") {
            Ok(token) if token.trim().is_empty() => Err(ConfigError::InvalidValue {
                key: "SLACK_BOT_TOKEN".to_string(),
                message: "must not be empty".to_string(),
            }),
            Ok(token) => Ok(Some(Self::new(SecretString::from(token)))),
            Err(_) => Ok(None),
        }
    }

    /// Point at a different API root (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }
}

/// JSON body for `chat.postMessage`.
fn post_message_body(channel_id: &str, thread_id: Option<&str>, text: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "channel": channel_id,
        "text": text,
    });
    if let Some(thread_ts) = thread_id {
        body["thread_ts"] = serde_json::Value::String(thread_ts.to_string());
    }
    body
}

#[async_trait]
impl Dispatcher for SlackDispatcher {
    async fn send(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&post_message_body(channel_id, thread_id, text))
            .send()
            .await
            .map_err(|e| DispatchError::SendFailed {
                channel_id: channel_id.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Http(format!("{status}: {body}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DispatchError::Http(format!("invalid response body: {e}")))?;

        if data.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let reason = data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            return Err(DispatchError::Rejected(reason.to_string()));
        }

        debug!(channel_id, thread_id = thread_id.unwrap_or("-"), "Slack message posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_thread_only_when_present() {
        let top = post_message_body("C1", None, "hi");
        assert_eq!(top["channel"], "C1");
        assert!(top.get("thread_ts").is_none());

        let threaded = post_message_body("C1", Some("1712.0001"), "hi");
        assert_eq!(threaded["thread_ts"], "1712.0001");
    }

    #[test]
    fn api_base_is_normalized() {
        let d = SlackDispatcher::new(SecretString::from("xoxb-test")).with_api_base("http://localhost:9/api/");
        assert_eq!(d.api_url("chat.postMessage"), "http://localhost:9/api/chat.postMessage");
    }

    #[tokio::test]
    async fn unreachable_api_is_a_send_failure() {
        let d = SlackDispatcher::new(SecretString::from("xoxb-test")).with_api_base("http://127.0.0.1:1");
        let err = d.send("C1", None, "hi").await.unwrap_err();
        assert!(matches!(err, DispatchError::SendFailed { .. }));
    }
}
