use crate::clock::SharedClock;
use crate::error::{LivewireError, Result};
use crate::event::is_available_topic;
use crate::message::Outbound;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<Outbound>,
    established_at: DateTime<Utc>,
    subscriptions: HashSet<String>,
    last_seen: DateTime<Utc>,
    awaiting_pong_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    topics: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(id)?;
        for topic in &entry.subscriptions {
            if let Some(members) = self.topics.get_mut(topic) {
                members.remove(id);
                if members.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
        Some(entry)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub established_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_subscriptions: usize,
    pub top_topics: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Live client connections and their topic subscriptions.
///
/// Each connection is represented by the sending half of its outbound queue;
/// the socket writer owns the receiving half. Broadcast never holds the lock
/// while writing, and any write that fails or exceeds the write timeout gets
/// that connection removed.
#[derive(Debug)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    clock: SharedClock,
    buffer: usize,
    write_timeout: Duration,
    pong_timeout: ChronoDuration,
}

impl ConnectionRegistry {
    pub fn new(
        clock: SharedClock,
        buffer: usize,
        write_timeout: Duration,
        pong_timeout: ChronoDuration,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clock,
            buffer: buffer.max(1),
            write_timeout,
            pong_timeout,
        }
    }

    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                sender,
                established_at: now,
                subscriptions: HashSet::new(),
                last_seen: now,
                awaiting_pong_since: None,
            },
        );
        tracing::info!(connection_id = %id, total = state.connections.len(), "Connection registered");
        (id, receiver)
    }

    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let mut state = self.state.write().await;
        match state.remove(id) {
            Some(_) => {
                tracing::info!(connection_id = %id, remaining = state.connections.len(), "Connection unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(&self, id: &ConnectionId, topics: &[String]) -> Result<SubscriptionOutcome> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| LivewireError::internal(format!("unknown connection {}", id)))?;

        let mut outcome = SubscriptionOutcome::default();
        for topic in topics {
            if is_available_topic(topic) {
                entry.subscriptions.insert(topic.clone());
                outcome.accepted.push(topic.clone());
            } else {
                outcome.rejected.push(topic.clone());
            }
        }
        for topic in &outcome.accepted {
            state.topics.entry(topic.clone()).or_default().insert(*id);
        }
        tracing::debug!(connection_id = %id, accepted = ?outcome.accepted, rejected = ?outcome.rejected, "Subscribed");
        Ok(outcome)
    }

    pub async fn unsubscribe(&self, id: &ConnectionId, topics: &[String]) -> Result<SubscriptionOutcome> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| LivewireError::internal(format!("unknown connection {}", id)))?;

        let mut outcome = SubscriptionOutcome::default();
        for topic in topics {
            if entry.subscriptions.remove(topic) {
                outcome.accepted.push(topic.clone());
            } else {
                outcome.rejected.push(topic.clone());
            }
        }
        for topic in &outcome.accepted {
            if let Some(members) = state.topics.get_mut(topic) {
                members.remove(id);
                if members.is_empty() {
                    state.topics.remove(topic);
                }
            }
        }
        Ok(outcome)
    }

    pub async fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn subscriptions_of(&self, id: &ConnectionId) -> Option<Vec<String>> {
        let state = self.state.read().await;
        let entry = state.connections.get(id)?;
        let mut topics: Vec<String> = entry.subscriptions.iter().cloned().collect();
        topics.sort();
        Some(topics)
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sends one frame to one connection, removing it if the write fails.
    pub async fn send_to(&self, id: &ConnectionId, frame: Outbound) -> Result<()> {
        let sender = {
            let state = self.state.read().await;
            state
                .connections
                .get(id)
                .map(|entry| entry.sender.clone())
                .ok_or_else(|| LivewireError::transport(id.to_string(), "connection not registered"))?
        };
        match timeout(self.write_timeout, sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.unregister(id).await;
                Err(LivewireError::transport(id.to_string(), "connection closed"))
            }
            Err(_) => {
                self.unregister(id).await;
                Err(LivewireError::transport(id.to_string(), "write timed out"))
            }
        }
    }

    /// Fans `frame` out to every subscriber of `topic` concurrently.
    pub async fn broadcast(&self, topic: &str, frame: Outbound) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let state = self.state.read().await;
            match state.topics.get(topic) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| state.connections.get(id).map(|e| (*id, e.sender.clone())))
                    .collect(),
                None => return BroadcastReport::default(),
            }
        };

        let write_timeout = self.write_timeout;
        let sends = targets.into_iter().map(|(id, sender)| {
            let frame = frame.clone();
            async move {
                let ok = matches!(timeout(write_timeout, sender.send(frame)).await, Ok(Ok(())));
                (id, ok)
            }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, ok) in results {
            if ok {
                report.delivered += 1;
            } else {
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            let mut state = self.state.write().await;
            for id in &failed {
                if state.remove(id).is_some() {
                    tracing::warn!(connection_id = %id, topic, "Dropping connection after failed write");
                    report.dropped += 1;
                }
            }
        }
        report
    }

    pub async fn touch(&self, id: &ConnectionId) {
        let now = self.clock.now();
        if let Some(entry) = self.state.write().await.connections.get_mut(id) {
            entry.last_seen = now;
            entry.awaiting_pong_since = None;
        }
    }

    /// Pings every connection not already awaiting a pong. Returns the count pinged.
    pub async fn ping_all(&self) -> usize {
        let now = self.clock.now();
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let mut state = self.state.write().await;
            state
                .connections
                .iter_mut()
                .filter(|(_, e)| e.awaiting_pong_since.is_none())
                .map(|(id, e)| {
                    e.awaiting_pong_since = Some(now);
                    (*id, e.sender.clone())
                })
                .collect()
        };

        let mut pinged = 0;
        for (id, sender) in targets {
            // A full buffer here just means the pong deadline decides.
            if sender.try_send(Outbound::Ping).is_ok() {
                pinged += 1;
            } else {
                tracing::debug!(connection_id = %id, "Ping not queued");
            }
        }
        pinged
    }

    /// Removes connections whose ping went unanswered past the pong deadline.
    pub async fn reap_stale(&self) -> Vec<ConnectionId> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let stale: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, e)| {
                e.awaiting_pong_since
                    .is_some_and(|since| now - since > self.pong_timeout)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.remove(id);
            tracing::info!(connection_id = %id, "Reaped unresponsive connection");
        }
        stale
    }

    /// Asks every writer to close and forgets all connections.
    pub async fn close_all(&self) {
        let mut state = self.state.write().await;
        for entry in state.connections.values() {
            let _ = entry.sender.try_send(Outbound::Close);
        }
        let closed = state.connections.len();
        state.connections.clear();
        state.topics.clear();
        tracing::info!(closed, "Closed all connections");
    }

    pub async fn info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let state = self.state.read().await;
        state.connections.get(id).map(|e| ConnectionInfo {
            id: *id,
            established_at: e.established_at,
            subscriptions: e.subscriptions.iter().cloned().collect(),
            last_seen: e.last_seen,
        })
    }

    pub async fn stats(&self) -> ConnectionStats {
        let state = self.state.read().await;
        let mut top_topics: Vec<(String, usize)> = state
            .topics
            .iter()
            .map(|(topic, members)| (topic.clone(), members.len()))
            .collect();
        top_topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_topics.truncate(5);
        ConnectionStats {
            active_connections: state.connections.len(),
            total_subscriptions: state.connections.values().map(|e| e.subscriptions.len()).sum(),
            top_topics,
        }
    }
}
