//! Delayed dispatch of planned replies.

mod delay;
pub mod model;

pub use delay::{DelayScheduler, spawn_prune_task};
pub use model::{Delivery, ReplyPayload, ScheduleEvent, ScheduleStatus, ScheduledResponse};
