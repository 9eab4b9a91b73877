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

//! Tumbling window assignment anchored to the Unix epoch.

use chrono::{DateTime, TimeDelta, Utc};
use std::{fmt, time::Duration};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum WindowError {
    #[error("window size must be at least one millisecond")]
    ZeroSize,
    #[error("window size {0:?} is too large")]
    SizeOutOfRange(Duration),
}

/// A time window defined by a start and (noninclusive) end timestamp
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// A window is closed once the watermark reached its end boundary.
    pub fn is_closed_by(&self, watermark: DateTime<Utc>) -> bool {
        watermark >= self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Assigns each timestamp to exactly one fixed-size, non-overlapping window.
///
/// Window starts are integer multiples of the window size since the epoch:
/// `start = floor(ts / size) * size`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TumblingWindows {
    size_ms: i64,
}

impl TumblingWindows {
    pub fn new(size: Duration) -> Result<Self, WindowError> {
        let size_ms = i64::try_from(size.as_millis())
            .map_err(|_| WindowError::SizeOutOfRange(size))?;
        if size_ms == 0 {
            return Err(WindowError::ZeroSize);
        }
        // Keep `start + size` representable for every chrono instant
        if TimeDelta::try_milliseconds(size_ms).is_none() {
            return Err(WindowError::SizeOutOfRange(size));
        }
        Ok(Self { size_ms })
    }

    pub fn size(&self) -> Duration {
        Duration::from_millis(self.size_ms as u64)
    }

    pub fn assign(&self, ts: DateTime<Utc>) -> Window {
        let start = self.window_start(ts);
        Window::new(start, self.end_of(start))
    }

    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts_ms = ts.timestamp_millis();
        let start_ms = ts_ms.div_euclid(self.size_ms) * self.size_ms;
        // Only instants within one window of the earliest representable time
        // have an aligned start below that time, clamp those to it
        DateTime::from_timestamp_millis(start_ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// End boundary of the window starting at `start`
    pub fn end_of(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(TimeDelta::milliseconds(self.size_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
