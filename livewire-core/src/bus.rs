use crate::error::{LivewireError, Result};
use crate::event::Event;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Processes one dequeued event. Implemented by whoever owns the bus.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct BusCounters {
    pub published: AtomicU64,
    pub rejected: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub capacity: usize,
    pub queued: usize,
    pub workers: usize,
    pub published: u64,
    pub rejected: u64,
    pub processed: u64,
    pub failed: u64,
    pub panicked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,
    pub aborted_workers: usize,
}

/// Bounded event queue drained by a fixed pool of workers.
///
/// Workers share the single receiver, so ordering is FIFO at dequeue time
/// only. A handler error or panic is confined to the event that caused it.
pub struct EventBus {
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<BusCounters>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            counters: Arc::new(BusCounters::default()),
        }
    }

    pub fn start(&self, handler: Arc<dyn EventHandler>, worker_count: usize) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..worker_count.max(1) {
            let receiver = Arc::clone(&self.receiver);
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&self.counters);
            workers.push(tokio::spawn(async move {
                run_worker(worker_id, receiver, handler, counters).await;
            }));
        }
        tracing::info!(workers = workers.len(), capacity = self.capacity, "Event bus started");
    }

    fn sender(&self) -> Result<mpsc::Sender<Event>> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(LivewireError::ShuttingDown)
    }

    /// Enqueues without waiting. A full queue is reported as `Backpressure`.
    pub fn publish(&self, event: Event) -> Result<()> {
        let sender = self.sender()?;
        match sender.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event_id = %event.id, capacity = self.capacity, "Event queue full");
                Err(LivewireError::Backpressure {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LivewireError::ShuttingDown),
        }
    }

    /// Waits for queue space instead of failing.
    pub async fn publish_blocking(&self, event: Event) -> Result<()> {
        let sender = self.sender()?;
        sender
            .send(event)
            .await
            .map_err(|_| LivewireError::ShuttingDown)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting events. Workers exit once the queue is empty.
    pub fn close(&self) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
    }

    pub fn is_accepting(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn stats(&self) -> BusStats {
        let queued = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |s| self.capacity - s.capacity());
        BusStats {
            capacity: self.capacity,
            queued,
            workers: self.workers.lock().unwrap_or_else(|e| e.into_inner()).len(),
            published: self.counters.published.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting events, lets workers drain what is queued, and aborts
    /// whatever is still running once `grace` expires.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.close();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!("Event bus drained");
                ShutdownReport {
                    drained: true,
                    aborted_workers: 0,
                }
            }
            Err(_) => {
                let still_running = aborters.iter().filter(|a| !a.is_finished()).count();
                for aborter in &aborters {
                    aborter.abort();
                }
                tracing::warn!(aborted = still_running, "Event bus drain exceeded grace period");
                ShutdownReport {
                    drained: false,
                    aborted_workers: still_running,
                }
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    handler: Arc<dyn EventHandler>,
    counters: Arc<BusCounters>,
) {
    loop {
        let next = { receiver.lock().await.recv().await };
        let Some(event) = next else {
            break;
        };
        let event_id = event.id.clone();
        let event_type = event.event_type;

        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker_id, event_id = %event_id, %event_type, error = %err, "Event processing failed");
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let fault = LivewireError::internal(message);
                tracing::error!(worker_id, event_id = %event_id, %event_type, error = %fault, "Worker caught fault");
            }
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Recording {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, event: Event) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match event.source.as_str() {
                "bad" => Err(LivewireError::dependency("predictor", "down")),
                "panic" => panic!("handler exploded"),
                _ => Ok(()),
            }
        }
    }

    struct Blocked {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EventHandler for Blocked {
        async fn handle(&self, _event: Event) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn event(source: &str) -> Event {
        Event::new(EventType::GameStatusChange, source, Map::new())
    }

    #[tokio::test]
    async fn faults_are_isolated_per_event() {
        let bus = EventBus::new(16);
        let handler = Arc::new(Recording {
            seen: AtomicUsize::new(0),
        });
        bus.start(handler.clone(), 2);

        for source in ["ok", "bad", "panic", "ok"] {
            bus.publish(event(source)).unwrap();
        }
        let report = bus.shutdown(Duration::from_secs(5)).await;

        assert!(report.drained);
        let stats = bus.stats();
        assert_eq!(handler.seen.load(Ordering::SeqCst), 4);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
    }

    #[tokio::test]
    async fn full_queue_signals_backpressure() {
        let bus = EventBus::new(2);
        // no workers started, nothing drains
        bus.publish(event("a")).unwrap();
        bus.publish(event("b")).unwrap();
        let err = bus.publish(event("c")).unwrap_err();
        assert!(matches!(err, LivewireError::Backpressure { capacity: 2 }));
        assert_eq!(bus.stats().rejected, 1);
        assert_eq!(bus.stats().queued, 2);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_refused() {
        let bus = EventBus::new(4);
        bus.shutdown(Duration::from_millis(10)).await;
        assert!(matches!(bus.publish(event("late")), Err(LivewireError::ShuttingDown)));
        assert!(!bus.is_accepting());
    }

    #[tokio::test]
    async fn stuck_workers_are_aborted_after_grace() {
        let bus = EventBus::new(4);
        let release = Arc::new(Notify::new());
        bus.start(Arc::new(Blocked { release }), 1);
        bus.publish(event("stuck")).unwrap();
        tokio::task::yield_now().await;

        let report = bus.shutdown(Duration::from_millis(50)).await;
        assert!(!report.drained);
        assert_eq!(report.aborted_workers, 1);
    }
}
