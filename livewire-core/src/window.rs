//! Rolling aggregates over a bounded time span.
//!
//! A window keeps its points in timestamp order in a `VecDeque` together with
//! per-key running sums and counts, so reads never rescan. A point is retained
//! while `timestamp > newest - span`; anything at or before the cutoff is
//! evicted and its contribution subtracted exactly once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowPoint {
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy)]
struct KeyAggregate {
    sum: f64,
    count: usize,
    latest: f64,
    latest_at: DateTime<Utc>,
}

impl KeyAggregate {
    fn new(at: DateTime<Utc>, value: f64) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            latest: value,
            latest_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct KeyStats {
    pub average: f64,
    pub sum: f64,
    pub count: usize,
    pub latest: Option<f64>,
}

#[derive(Debug)]
pub struct SlidingWindow {
    span: Duration,
    max_points: usize,
    points: VecDeque<WindowPoint>,
    aggregates: HashMap<String, KeyAggregate>,
    newest: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(span: Duration, max_points: usize) -> Self {
        Self {
            span,
            max_points: max_points.max(1),
            points: VecDeque::new(),
            aggregates: HashMap::new(),
            newest: None,
        }
    }

    /// Adds a point and evicts everything the new point pushes out of span.
    ///
    /// Late points are inserted in timestamp order. A point already outside
    /// the span is dropped and `false` is returned.
    pub fn add_point(&mut self, timestamp: DateTime<Utc>, values: HashMap<String, f64>) -> bool {
        if let Some(newest) = self.newest {
            if timestamp <= newest - self.span {
                return false;
            }
        }

        for (key, value) in &values {
            let agg = self
                .aggregates
                .entry(key.clone())
                .or_insert_with(|| KeyAggregate::new(timestamp, *value));
            agg.sum += value;
            agg.count += 1;
            // equal timestamps are ordered by arrival, so the newer arrival wins
            if timestamp >= agg.latest_at {
                agg.latest = *value;
                agg.latest_at = timestamp;
            }
        }

        let point = WindowPoint { timestamp, values };
        match self.points.back() {
            Some(last) if last.timestamp > timestamp => {
                let idx = self.points.partition_point(|p| p.timestamp <= timestamp);
                self.points.insert(idx, point);
            }
            _ => self.points.push_back(point),
        }

        let newest = self.newest.map_or(timestamp, |n| n.max(timestamp));
        self.newest = Some(newest);
        self.evict_before(newest - self.span);

        while self.points.len() > self.max_points {
            self.pop_oldest();
        }
        true
    }

    /// Evicts points that have aged out as of `now`, without adding anything.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) {
        self.evict_before(now - self.span);
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self
            .points
            .front()
            .is_some_and(|p| p.timestamp <= cutoff)
        {
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        let Some(point) = self.points.pop_front() else {
            return;
        };
        for (key, value) in point.values {
            let Some(agg) = self.aggregates.get_mut(&key) else {
                continue;
            };
            agg.count -= 1;
            agg.sum -= value;
            if agg.count == 0 {
                self.aggregates.remove(&key);
            } else if agg.latest_at <= point.timestamp {
                if let Some((at, latest)) = newest_value(&self.points, &key) {
                    agg.latest = latest;
                    agg.latest_at = at;
                }
            }
        }
        if self.points.is_empty() {
            self.newest = None;
        }
    }

    pub fn sum(&self, key: &str) -> f64 {
        self.aggregates.get(key).map_or(0.0, |a| a.sum)
    }

    pub fn count(&self, key: &str) -> usize {
        self.aggregates.get(key).map_or(0, |a| a.count)
    }

    pub fn average(&self, key: &str) -> f64 {
        match self.aggregates.get(key) {
            Some(agg) if agg.count > 0 => agg.sum / agg.count as f64,
            _ => 0.0,
        }
    }

    /// Most recent retained value for `key`.
    pub fn latest(&self, key: &str) -> Option<f64> {
        self.aggregates.get(key).map(|a| a.latest)
    }

    pub fn stats(&self, key: &str) -> KeyStats {
        KeyStats {
            average: self.average(key),
            sum: self.sum(key),
            count: self.count(key),
            latest: self.latest(key),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.aggregates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &WindowPoint> {
        self.points.iter()
    }

    pub fn snapshot(&self, name: &str) -> WindowSnapshot {
        WindowSnapshot {
            name: name.to_string(),
            span_secs: self.span.num_seconds(),
            points: self.points.iter().cloned().collect(),
            stats: self
                .aggregates
                .keys()
                .map(|k| (k.clone(), self.stats(k)))
                .collect(),
        }
    }

    /// Replays snapshot points; aggregates are rebuilt from them.
    pub fn restore(&mut self, snapshot: WindowSnapshot) {
        for point in snapshot.points {
            self.add_point(point.timestamp, point.values);
        }
    }
}

fn newest_value(points: &VecDeque<WindowPoint>, key: &str) -> Option<(DateTime<Utc>, f64)> {
    points
        .iter()
        .rev()
        .find_map(|p| p.values.get(key).map(|v| (p.timestamp, *v)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub name: String,
    pub span_secs: i64,
    pub points: Vec<WindowPoint>,
    pub stats: HashMap<String, KeyStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSummary {
    pub name: String,
    pub points: usize,
    pub keys: HashMap<String, KeyStats>,
}

/// Named windows, each behind its own lock so updates to one window never
/// contend with another.
#[derive(Debug)]
pub struct WindowSet {
    span: Duration,
    max_points: usize,
    windows: RwLock<HashMap<String, Arc<Mutex<SlidingWindow>>>>,
}

impl WindowSet {
    pub fn new(span: Duration, max_points: usize) -> Self {
        Self {
            span,
            max_points,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_windows<'a>(
        span: Duration,
        max_points: usize,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let set = Self::new(span, max_points);
        for name in names {
            set.get_or_create(name);
        }
        set
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<SlidingWindow>>> {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Mutex<SlidingWindow>> {
        if let Some(window) = self.get(name) {
            return window;
        }
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        windows
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::new(self.span, self.max_points))))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn add_point(&self, name: &str, timestamp: DateTime<Utc>, values: HashMap<String, f64>) -> bool {
        let window = self.get_or_create(name);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        window.add_point(timestamp, values)
    }

    /// Statistics for one key as of `now`. Unknown windows read as empty.
    pub fn stats(&self, name: &str, key: &str, now: DateTime<Utc>) -> KeyStats {
        match self.get(name) {
            Some(window) => {
                let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                window.evict_expired(now);
                window.stats(key)
            }
            None => KeyStats::default(),
        }
    }

    pub fn summaries(&self, now: DateTime<Utc>) -> Vec<WindowSummary> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let window = self.get(&name)?;
                let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                window.evict_expired(now);
                let keys = window
                    .keys()
                    .map(|k| (k.to_string(), window.stats(k)))
                    .collect();
                Some(WindowSummary {
                    points: window.len(),
                    name,
                    keys,
                })
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<WindowSnapshot> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let window = self.get(&name)?;
                let window = window.lock().unwrap_or_else(|e| e.into_inner());
                Some(window.snapshot(&name))
            })
            .collect()
    }

    pub fn restore(&self, snapshot: WindowSnapshot) {
        let window = self.get_or_create(&snapshot.name);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        window.restore(snapshot);
    }
}
