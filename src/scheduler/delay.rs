//! Delay scheduler: holds at most one pending reply per message id and fires
//! each one on its own tokio timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Delivery, ReplyPayload, ScheduleEvent, ScheduleStatus, ScheduledResponse};
use crate::config::DelayConfig;
use crate::decision::types::UrgencyLevel;
use crate::dispatch::Dispatcher;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

struct Entry {
    record: ScheduledResponse,
    timer: Option<JoinHandle<()>>,
    /// Order in which the entry became terminal; 0 while pending.
    finished_seq: u64,
}

impl Entry {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn finish(&mut self, status: ScheduleStatus, seq: u64) {
        self.record.status = status;
        self.record.updated_at = Utc::now();
        self.finished_seq = seq;
    }
}

pub struct DelayScheduler {
    delays: DelayConfig,
    dispatcher: Arc<dyn Dispatcher>,
    entries: Mutex<HashMap<String, Entry>>,
    /// Final status of pruned entries, so `cancel` and `status` keep
    /// answering for them. Locked after `entries`, never across an await.
    settled: StdMutex<HashMap<String, ScheduleStatus>>,
    finished: AtomicU64,
    tx: broadcast::Sender<ScheduleEvent>,
}

impl DelayScheduler {
    pub fn new(delays: DelayConfig, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            delays,
            dispatcher,
            entries: Mutex::new(HashMap::new()),
            settled: StdMutex::new(HashMap::new()),
            finished: AtomicU64::new(0),
            tx,
        })
    }

    fn settled(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleStatus>> {
        self.settled.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_seq(&self) -> u64 {
        self.finished.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn delays(&self) -> &DelayConfig {
        &self.delays
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.tx.subscribe()
    }

    /// Schedule `payload` after the delay configured for `urgency`. A pending
    /// entry for the same message id is cancelled and replaced. Delays above
    /// [`DelayConfig::MAX_DELAY`] are clamped to it.
    pub async fn schedule(
        self: &Arc<Self>,
        message_id: &str,
        urgency: UrgencyLevel,
        payload: ReplyPayload,
    ) -> ScheduledResponse {
        let configured = self.delays.delay_for(urgency);
        let delay = configured.min(DelayConfig::MAX_DELAY);
        if delay < configured {
            warn!(
                message_id,
                configured_secs = configured.as_secs(),
                delay_secs = delay.as_secs(),
                "Delay above maximum, clamping"
            );
        }
        let deadline = tokio::time::Instant::now() + delay;
        let record = ScheduledResponse::new(message_id, urgency, payload, delay);
        let id = record.id;

        let mut entries = self.entries.lock().await;

        if let Some(previous) = entries.get_mut(message_id)
            && previous.record.status == ScheduleStatus::Pending
        {
            previous.stop_timer();
            previous.finish(ScheduleStatus::Cancelled, self.next_seq());
            info!(
                message_id,
                replaced = %previous.record.id,
                "Superseding pending reply"
            );
            let _ = self.tx.send(ScheduleEvent::Superseded {
                message_id: message_id.to_string(),
                replaced: previous.record.id,
            });
        }

        let timer = self.spawn_timer(message_id.to_string(), id, deadline);
        entries.insert(
            message_id.to_string(),
            Entry {
                record: record.clone(),
                timer: Some(timer),
                finished_seq: 0,
            },
        );
        self.settled().remove(message_id);
        drop(entries);

        info!(
            message_id,
            urgency = %urgency,
            delay_secs = delay.as_secs(),
            branch = record.payload.branch.label(),
            "Reply scheduled"
        );
        let _ = self.tx.send(ScheduleEvent::Scheduled {
            response: record.clone(),
        });

        record
    }

    /// Cancel the pending reply for `message_id`. Terminal entries are left
    /// untouched and their status returned, including pruned ones; unknown
    /// ids return `None`.
    pub async fn cancel(&self, message_id: &str) -> Option<ScheduleStatus> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(message_id) else {
            return self.settled().get(message_id).copied();
        };

        if entry.record.status != ScheduleStatus::Pending {
            debug!(message_id, status = ?entry.record.status, "Cancel on finished entry");
            return Some(entry.record.status);
        }

        entry.stop_timer();
        entry.finish(ScheduleStatus::Cancelled, self.next_seq());
        info!(message_id, "Scheduled reply cancelled");

        let _ = self.tx.send(ScheduleEvent::Cancelled {
            message_id: message_id.to_string(),
            id: entry.record.id,
        });

        Some(ScheduleStatus::Cancelled)
    }

    /// Current status for `message_id`, including pruned entries.
    pub async fn status(&self, message_id: &str) -> Option<ScheduleStatus> {
        let entries = self.entries.lock().await;
        match entries.get(message_id) {
            Some(entry) => Some(entry.record.status),
            None => self.settled().get(message_id).copied(),
        }
    }

    /// Full record for `message_id`. `None` once pruned.
    pub async fn get(&self, message_id: &str) -> Option<ScheduledResponse> {
        self.entries
            .lock()
            .await
            .get(message_id)
            .map(|e| e.record.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.record.status == ScheduleStatus::Pending)
            .count()
    }

    /// Pending entries plus dispatches still awaiting the dispatcher.
    pub async fn unsettled_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.record.status == ScheduleStatus::Pending || e.record.is_in_flight())
            .count()
    }

    /// Drop the oldest finished entries, keeping at most `keep` of them.
    /// Returns the number removed.
    pub async fn prune_finished(&self, keep: usize) -> usize {
        let mut entries = self.entries.lock().await;

        let mut finished: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, e)| e.record.status.is_terminal() && !e.record.is_in_flight())
            .map(|(id, e)| (id.clone(), e.finished_seq))
            .collect();

        let excess = finished.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }

        finished.sort_by_key(|(_, seq)| *seq);
        let mut settled = self.settled();
        for (id, _) in finished.into_iter().take(excess) {
            if let Some(entry) = entries.remove(&id) {
                settled.insert(id, entry.record.status);
            }
        }
        drop(settled);

        debug!(removed = excess, "Pruned finished replies");
        excess
    }

    /// Cancel every pending reply. Returns how many were cancelled.
    pub async fn shutdown(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let mut cancelled = 0;

        for (message_id, entry) in entries.iter_mut() {
            if entry.record.status != ScheduleStatus::Pending {
                continue;
            }
            entry.stop_timer();
            entry.finish(ScheduleStatus::Cancelled, self.next_seq());
            cancelled += 1;
            let _ = self.tx.send(ScheduleEvent::Cancelled {
                message_id: message_id.clone(),
                id: entry.record.id,
            });
        }

        if cancelled > 0 {
            info!(count = cancelled, "Cancelled pending replies on shutdown");
        }
        cancelled
    }

    /// Wait until nothing is pending or in flight.
    pub async fn drain(&self) {
        let mut rx = self.subscribe();
        while self.unsettled_count().await > 0 {
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn spawn_timer(
        self: &Arc<Self>,
        message_id: String,
        id: Uuid,
        deadline: tokio::time::Instant,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            scheduler.fire(&message_id, id).await;
        })
    }

    /// Claim the entry, send outside the lock, then record the outcome.
    async fn fire(&self, message_id: &str, id: Uuid) {
        let payload = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(message_id) else {
                return;
            };
            if entry.record.id != id || entry.record.status != ScheduleStatus::Pending {
                return;
            }
            entry.finish(ScheduleStatus::Dispatched, self.next_seq());
            entry.timer = None;
            entry.record.payload.clone()
        };

        let result = self
            .dispatcher
            .send(&payload.channel_id, payload.thread_id.as_deref(), &payload.text)
            .await;

        let (delivery, event) = match result {
            Ok(()) => {
                info!(
                    message_id,
                    channel_id = %payload.channel_id,
                    branch = payload.branch.label(),
                    "Reply dispatched"
                );
                (
                    Delivery::Delivered,
                    ScheduleEvent::Dispatched {
                        message_id: message_id.to_string(),
                        id,
                    },
                )
            }
            Err(e) => {
                warn!(
                    message_id,
                    channel_id = %payload.channel_id,
                    error = %e,
                    "Reply dispatch failed"
                );
                (
                    Delivery::Failed {
                        reason: e.to_string(),
                    },
                    ScheduleEvent::DispatchFailed {
                        message_id: message_id.to_string(),
                        id,
                        reason: e.to_string(),
                    },
                )
            }
        };

        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(message_id)
                && entry.record.id == id
            {
                entry.record.delivery = Some(delivery);
                entry.record.updated_at = Utc::now();
            }
        }

        let _ = self.tx.send(event);
    }
}

/// Spawn a background task that periodically prunes finished replies.
pub fn spawn_prune_task(
    scheduler: Arc<DelayScheduler>,
    every: Duration,
    keep: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            scheduler.prune_finished(keep).await;
        }
    })
}
