//! Scheduled reply data model and broadcast event types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::types::{ResponseBranch, UrgencyLevel};

/// Lifecycle of a scheduled reply. `Dispatched` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for its timer.
    Pending,
    /// Claimed by the timer and handed to the dispatcher.
    Dispatched,
    /// Cancelled or superseded before firing.
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Result of handing a fired reply to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    Failed { reason: String },
}

/// What gets sent when the timer fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub text: String,
    pub branch: ResponseBranch,
}

/// A reply waiting for (or past) its dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledResponse {
    pub id: Uuid,
    pub message_id: String,
    pub urgency: UrgencyLevel,
    pub payload: ReplyPayload,
    pub delay: Duration,
    pub created_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    /// `None` until the timer fires.
    pub delivery: Option<Delivery>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledResponse {
    pub fn new(
        message_id: impl Into<String>,
        urgency: UrgencyLevel,
        payload: ReplyPayload,
        delay: Duration,
    ) -> Self {
        let now = Utc::now();
        let fire_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            message_id: message_id.into(),
            urgency,
            payload,
            delay,
            created_at: now,
            fire_at,
            status: ScheduleStatus::Pending,
            delivery: None,
            updated_at: now,
        }
    }

    /// Dispatched but the dispatcher hasn't reported back yet.
    pub fn is_in_flight(&self) -> bool {
        self.status == ScheduleStatus::Dispatched && self.delivery.is_none()
    }
}

/// Broadcast to scheduler subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleEvent {
    Scheduled { response: ScheduledResponse },
    Superseded { message_id: String, replaced: Uuid },
    Cancelled { message_id: String, id: Uuid },
    Dispatched { message_id: String, id: Uuid },
    DispatchFailed { message_id: String, id: Uuid, reason: String },
}
