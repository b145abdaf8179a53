//! Stdin event source: one JSON message per line.
//!
//! Accepts both the native field names and Slack's (`ts`, `channel`, `user`,
//! `thread_ts`). Blank lines are ignored; unparseable lines are logged and
//! skipped. Slack events that are not fresh human messages (other event
//! types, edits, deletions, joins, bot posts) are dropped.

use chrono::{DateTime, Utc};
use futures::stream;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::channels::MessageStream;
use crate::decision::types::Message;

/// Message subtypes that never reach the planner.
const IGNORED_SUBTYPES: &[&str] = &[
    "message_deleted",
    "message_changed",
    "channel_join",
    "bot_message",
];

#[derive(Debug, Deserialize)]
struct InboundEvent {
    /// Slack event type. Absent for native events.
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(alias = "ts")]
    id: String,
    #[serde(alias = "channel")]
    channel_id: String,
    /// Bot posts may omit it; required once an event passes the filter.
    #[serde(default, alias = "user")]
    user_id: String,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default, alias = "thread_ts")]
    thread_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl InboundEvent {
    fn is_processable(&self) -> bool {
        if self.kind.as_deref().is_some_and(|k| k != "message") {
            return false;
        }
        if self
            .subtype
            .as_deref()
            .is_some_and(|st| IGNORED_SUBTYPES.contains(&st))
        {
            return false;
        }
        self.bot_id.as_deref().is_none_or(str::is_empty)
    }
}

impl From<InboundEvent> for Message {
    fn from(event: InboundEvent) -> Self {
        Message {
            id: event.id,
            channel_id: event.channel_id,
            user_id: event.user_id,
            user_name: event.user_name,
            text: event.text,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            thread_id: event.thread_id,
        }
    }
}

/// Parse one input line. `Ok(None)` for blank lines and filtered events.
pub fn parse_event(line: &str) -> Result<Option<Message>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: InboundEvent = serde_json::from_str(line)?;
    if !event.is_processable() {
        tracing::debug!(
            id = %event.id,
            kind = event.kind.as_deref().unwrap_or("-"),
            subtype = event.subtype.as_deref().unwrap_or("-"),
            "Ignoring event"
        );
        return Ok(None);
    }
    if event.user_id.is_empty() {
        return Err(serde::de::Error::missing_field("user_id"));
    }
    Ok(Some(event.into()))
}

/// Reads JSON-lines messages from stdin.
pub struct StdinEvents;

impl StdinEvents {
    pub fn start() -> MessageStream {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    /// Same as [`start`](Self::start) over any buffered reader.
    pub fn from_reader<R>(reader: R) -> MessageStream
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = reader.lines();
            let mut line_no = 0usize;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        line_no += 1;
                        match parse_event(&line) {
                            Ok(Some(msg)) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(line = line_no, error = %e, "Skipping malformed event");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading events: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!(lines = line_no, "Event source exhausted");
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Box::pin(stream)
    }
}
