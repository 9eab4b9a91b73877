// Copyright (C) 2025-present The SensorAgg Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event-time watermarks under bounded out-of-orderness.
//!
//! The watermark asserts that no event with an earlier timestamp is expected
//! anymore. It is derived from the stream itself as
//! `max(observed event times) - bounded_delay` and is recomputed synchronously
//! on every observation, there is no separate emission schedule.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BoundedOutOfOrderness {
    bounded_delay: TimeDelta,
    max_seen: Option<DateTime<Utc>>,
    /// Lower bound imposed from outside (e.g. combined upstream watermark)
    floor: Option<DateTime<Utc>>,
}

impl BoundedOutOfOrderness {
    pub fn new(bounded_delay: Duration) -> Self {
        let bounded_delay = TimeDelta::from_std(bounded_delay).unwrap_or(TimeDelta::MAX);
        Self {
            bounded_delay,
            max_seen: None,
            floor: None,
        }
    }

    pub fn bounded_delay(&self) -> TimeDelta {
        self.bounded_delay
    }

    /// Maximum event time observed so far
    pub fn max_seen(&self) -> Option<DateTime<Utc>> {
        self.max_seen
    }

    /// Record an event time and return the (possibly advanced) watermark.
    pub fn observe(&mut self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_seen = Some(match self.max_seen {
            Some(max_seen) => max_seen.max(ts),
            None => ts,
        });
        self.current()
    }

    /// Move the watermark forward independently of observed events. Never
    /// moves it backwards.
    pub fn advance_to(&mut self, watermark: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.floor = Some(match self.floor {
            Some(floor) => floor.max(watermark),
            None => watermark,
        });
        self.current()
    }

    /// Current watermark, `None` until the first event was observed.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        let derived = self.max_seen.map(|max_seen| {
            max_seen
                .checked_sub_signed(self.bounded_delay)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        match (derived, self.floor) {
            (Some(derived), Some(floor)) => Some(derived.max(floor)),
            (derived, floor) => derived.or(floor),
        }
    }
}

/// Watermark of a consumer fed by several partitions: the minimum of the
/// partition watermarks. A partition that has not produced a watermark yet
/// holds the combined watermark back.
pub fn combine_watermarks<I>(watermarks: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = Option<DateTime<Utc>>>,
{
    let mut combined: Option<DateTime<Utc>> = None;
    let mut any = false;
    for watermark in watermarks {
        any = true;
        let watermark = watermark?;
        combined = Some(match combined {
            Some(current) => current.min(watermark),
            None => watermark,
        });
    }
    if any {
        combined
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, min, sec).unwrap()
    }

    #[test]
    fn test_no_watermark_before_first_event() {
        let generator = BoundedOutOfOrderness::new(Duration::from_secs(5));
        assert_eq!(generator.current(), None);
        assert_eq!(generator.max_seen(), None);
    }

    #[test]
    fn test_watermark_trails_max_by_delay() {
        let mut generator = BoundedOutOfOrderness::new(Duration::from_secs(5));
        assert_eq!(generator.observe(ts(0, 10)), Some(ts(0, 5)));
        assert_eq!(generator.observe(ts(1, 5)), Some(ts(1, 0)));
        assert_eq!(generator.max_seen(), Some(ts(1, 5)));
    }

    #[test]
    fn test_watermark_is_monotonic_under_out_of_order_events() {
        let mut generator = BoundedOutOfOrderness::new(Duration::from_secs(5));
        let events = [ts(0, 50), ts(0, 20), ts(0, 52), ts(0, 1), ts(0, 51)];
        let mut previous = None;
        for event in events {
            let current = generator.observe(event);
            assert!(current >= previous, "{current:?} < {previous:?}");
            previous = current;
        }
        assert_eq!(previous, Some(ts(0, 47)));
    }

    #[test]
    fn test_advance_to_never_regresses() {
        let mut generator = BoundedOutOfOrderness::new(Duration::from_secs(5));
        generator.observe(ts(0, 30));
        assert_eq!(generator.advance_to(ts(2, 0)), Some(ts(2, 0)));
        assert_eq!(generator.advance_to(ts(1, 0)), Some(ts(2, 0)));
        // Events behind the floor do not pull the watermark back
        assert_eq!(generator.observe(ts(0, 40)), Some(ts(2, 0)));
        // Events far ahead move it past the floor
        assert_eq!(generator.observe(ts(3, 0)), Some(ts(2, 55)));
    }

    #[test]
    fn test_combine_watermarks_takes_minimum() {
        assert_eq!(
            combine_watermarks([Some(ts(1, 0)), Some(ts(0, 30)), Some(ts(2, 0))]),
            Some(ts(0, 30))
        );
    }

    #[test]
    fn test_combine_watermarks_waits_for_all_partitions() {
        assert_eq!(combine_watermarks([Some(ts(1, 0)), None]), None);
        assert_eq!(combine_watermarks(Vec::new()), None);
    }
}
