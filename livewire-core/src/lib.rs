//! Real-time event distribution and alerting engine.
//!
//! Events are published onto a bounded [`bus::EventBus`], folded into
//! [`window::SlidingWindow`] aggregates, pushed to topic subscribers through
//! the [`registry::ConnectionRegistry`], and checked against alert rules by
//! the [`alerts::AlertEngine`]. The [`dispatcher::Dispatcher`] owns all of it.

pub mod alerts;
pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod predictor;
pub mod registry;
pub mod window;

pub use alerts::{Alert, AlertCondition, AlertRule, AlertSeverity, AlertTransition, MetricRef};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EngineConfig, MetricMapping};
pub use dispatcher::{Collaborators, Dispatcher};
pub use error::{LivewireError, Result};
pub use event::{Event, EventType, AVAILABLE_TOPICS};
pub use message::{ClientMessage, Outbound, QueryType, RuleOperation, ServerMessage};
pub use persistence::{KeyValueStore, MemoryStore};
pub use predictor::{Prediction, Predictor};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use window::{KeyStats, SlidingWindow, WindowSet};
