use super::channels::NotificationChannel;
use super::{Alert, AlertSeverity};
use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::dead_letter::{DeadLetter, DeadLetterLog};
use crate::error::{LivewireError, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Triggered,
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub alert: Alert,
    pub kind: NotificationKind,
    /// Severity to report, which is raised above the rule's on escalation.
    pub severity: AlertSeverity,
    pub channels: Vec<String>,
}

/// Invoked once per notification when at least one channel accepted it.
pub type DeliveryCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Default)]
struct DeliveryCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

struct Delivery {
    channels: RwLock<HashMap<String, Arc<dyn NotificationChannel>>>,
    breakers: CircuitBreakerRegistry,
    dead_letters: Arc<DeadLetterLog>,
    counters: DeliveryCounters,
    on_delivered: RwLock<Option<DeliveryCallback>>,
}

/// Bounded queue of notifications drained by a fixed number of senders.
///
/// Every channel of a notification is attempted independently behind its own
/// circuit breaker; failures are dead-lettered and never affect siblings.
pub struct NotificationDispatcher {
    capacity: usize,
    worker_count: usize,
    sender: Mutex<Option<mpsc::Sender<Notification>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Notification>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    delivery: Arc<Delivery>,
}

impl NotificationDispatcher {
    pub fn new(
        worker_count: usize,
        capacity: usize,
        breakers: CircuitBreakerRegistry,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            capacity,
            worker_count: worker_count.max(1),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            delivery: Arc::new(Delivery {
                channels: RwLock::new(HashMap::new()),
                breakers,
                dead_letters,
                counters: DeliveryCounters::default(),
                on_delivered: RwLock::new(None),
            }),
        }
    }

    pub fn register_channel(&self, channel: Arc<dyn NotificationChannel>) {
        let name = channel.name().to_string();
        tracing::info!(channel = %name, "Notification channel registered");
        self.delivery
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, channel);
    }

    pub fn on_delivered(&self, callback: DeliveryCallback) {
        *self
            .delivery
            .on_delivered
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.worker_count {
            let receiver = Arc::clone(&self.receiver);
            let delivery = Arc::clone(&self.delivery);
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { receiver.lock().await.recv().await };
                    let Some(notification) = next else {
                        break;
                    };
                    delivery.deliver(notification).await;
                }
                tracing::debug!(worker_id, "Notification worker stopped");
            }));
        }
    }

    /// Queues a notification. Overflow is dead-lettered and reported.
    pub fn enqueue(&self, notification: Notification) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(LivewireError::ShuttingDown)?;

        match sender.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(notification))
            | Err(mpsc::error::TrySendError::Closed(notification)) => {
                self.delivery.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.delivery.dead_letters.record(DeadLetter::new(
                    "notification",
                    "notification queue full",
                    serde_json::to_value(&notification).unwrap_or_default(),
                ));
                Err(LivewireError::Backpressure {
                    capacity: self.capacity,
                })
            }
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        let counters = &self.delivery.counters;
        DeliveryStats {
            sent: counters.sent.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.delivery.dead_letters
    }

    /// Stops intake and waits up to `grace` for queued notifications to go out.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            tracing::warn!("Notification drain exceeded grace period");
            for aborter in aborters {
                aborter.abort();
            }
        }
    }
}

impl Delivery {
    async fn deliver(&self, notification: Notification) {
        let attempts = notification.channels.iter().map(|name| {
            let channel = self
                .channels
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(name)
                .cloned();
            let notification = &notification;
            async move {
                let outcome = match channel {
                    Some(channel) => {
                        let breaker = self.breakers.get_or_create(name);
                        breaker
                            .call(|| channel.send(notification))
                            .await
                            .map_err(|e| match e {
                                BreakerError::Inner(err) => err,
                                other => LivewireError::transport(name, other.to_string()),
                            })
                    }
                    None => Err(LivewireError::transport(name, "channel not registered")),
                };
                (name, outcome)
            }
        });

        let mut delivered = false;
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    delivered = true;
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(alert_id = %notification.alert.id, channel = %name, "Notification sent");
                }
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(alert_id = %notification.alert.id, channel = %name, error = %err, "Notification failed");
                    self.dead_letters.record(
                        DeadLetter::new(
                            "notification",
                            err.to_string(),
                            serde_json::to_value(&notification).unwrap_or_default(),
                        )
                        .on_channel(name),
                    );
                }
            }
        }

        if delivered {
            let callback = self
                .on_delivered
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(callback) = callback {
                callback(&notification);
            }
        }
    }
}
