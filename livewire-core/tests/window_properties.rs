//! Property tests for sliding-window aggregates.

use chrono::{DateTime, Duration, TimeZone, Utc};
use livewire_core::SlidingWindow;
use proptest::prelude::*;
use std::collections::HashMap;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Steps of (gap since previous point in seconds, key index, value).
fn arb_steps() -> impl Strategy<Value = Vec<(i64, usize, i32)>> {
    prop::collection::vec((0i64..40, 0usize..3, -1_000i32..1_000), 1..300)
}

const KEYS: [&str; 3] = ["a", "b", "c"];

proptest! {
    /// After any insert/evict sequence, sum and count equal a fresh
    /// derivation over exactly the points newer than `now - span`.
    #[test]
    fn aggregates_match_retained_points(steps in arb_steps(), span in 1i64..120, query_gap in 0i64..200) {
        let mut window = SlidingWindow::new(Duration::seconds(span), usize::MAX);
        let mut inserted: Vec<(i64, usize, f64)> = Vec::new();
        let mut clock = 0i64;

        for (gap, key, value) in steps {
            clock += gap;
            let value = value as f64;
            window.add_point(at(clock), HashMap::from([(KEYS[key].to_string(), value)]));
            inserted.push((clock, key, value));
        }

        let now = clock + query_gap;
        window.evict_expired(at(now));

        for (idx, key) in KEYS.iter().enumerate() {
            let expected: Vec<f64> = inserted
                .iter()
                .filter(|(ts, k, _)| *k == idx && *ts > now - span)
                .map(|(_, _, v)| *v)
                .collect();
            let expected_sum: f64 = expected.iter().sum();

            prop_assert_eq!(window.count(key), expected.len());
            prop_assert!((window.sum(key) - expected_sum).abs() < 1e-6);
            prop_assert_eq!(window.latest(key), expected.last().copied());
            if expected.is_empty() {
                prop_assert_eq!(window.average(key), 0.0);
            }
        }

        let retained_from_points: usize = window.points().map(|p| p.values.len()).sum();
        let counted: usize = KEYS.iter().map(|k| window.count(k)).sum();
        prop_assert_eq!(retained_from_points, counted);
        for point in window.points() {
            prop_assert!(point.timestamp > at(now - span));
        }
    }

    /// Late points never corrupt the aggregates.
    #[test]
    fn out_of_order_inserts_stay_consistent(offsets in prop::collection::vec(-30i64..30, 1..100)) {
        let mut window = SlidingWindow::new(Duration::seconds(60), usize::MAX);
        let base = 1_000i64;
        for (i, offset) in offsets.iter().enumerate() {
            window.add_point(at(base + i as i64 + offset), HashMap::from([("v".to_string(), 1.0)]));
        }
        let from_points = window.points().filter(|p| p.values.contains_key("v")).count();
        prop_assert_eq!(window.count("v"), from_points);
        prop_assert!((window.sum("v") - from_points as f64).abs() < 1e-9);

        let timestamps: Vec<_> = window.points().map(|p| p.timestamp).collect();
        prop_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[test]
fn span_sixty_keeps_last_two_points() {
    let mut window = SlidingWindow::new(Duration::seconds(60), 1_000);
    for ts in [0, 10, 20, 70] {
        window.add_point(at(ts), HashMap::from([("value".to_string(), 1.0)]));
    }
    window.evict_expired(at(70));
    assert_eq!(window.count("value"), 2);
    assert_eq!(window.sum("value"), 2.0);
}
