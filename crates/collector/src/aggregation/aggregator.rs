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

//! Per sensor and window aggregation of readings.
//!
//! - `MeasurementStats` - running sum, minimum and maximum of one measurement
//! - `SensorAccumulator` - partial aggregate of one sensor in one window,
//!   implements [`Aggregator`] so it can be driven by the window store
//! - `SensorAggregate` - the final, immutable result emitted when a window
//!   fires

use chrono::{DateTime, SecondsFormat, Utc};
use sensoragg_analytics::{aggregation::Aggregator, window::Window};
use sensoragg_reading::{Metadata, SensorReading};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Running sum, minimum and maximum of a single measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementStats {
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for MeasurementStats {
    fn default() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl MeasurementStats {
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn push(self, value: f64) -> Self {
        Self {
            sum: self.sum + value,
            min: self.min.min(value),
            max: self.max.max(value),
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Mean over `count` pushed values, `None` when nothing was pushed
    pub fn average(&self, count: u64) -> Option<f64> {
        if count == 0 {
            None
        } else {
            Some(self.sum / count as f64)
        }
    }
}

/// Sensor description taken from the first reading of a window
#[derive(Debug, Clone, PartialEq)]
struct SensorIdentity {
    sensor_id: String,
    sensor_type: Option<String>,
    location: Option<String>,
    metadata: Metadata,
}

impl From<&SensorReading> for SensorIdentity {
    fn from(reading: &SensorReading) -> Self {
        Self {
            sensor_id: reading.key().to_string(),
            sensor_type: reading.sensor_type().map(str::to_string),
            location: reading.location().map(str::to_string),
            metadata: reading.metadata().clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LatestStatus {
    event_time: DateTime<Utc>,
    status: Option<String>,
}

/// Partial aggregate for one sensor in one window.
///
/// The zero-count accumulator is the identity of [`SensorAccumulator::merge`]
/// and never produces an aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorAccumulator {
    identity: Option<SensorIdentity>,
    count: u64,
    temperature: MeasurementStats,
    humidity: MeasurementStats,
    pressure: MeasurementStats,
    battery_level: MeasurementStats,
    latest: Option<LatestStatus>,
}

impl SensorAccumulator {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn temperature(&self) -> &MeasurementStats {
        &self.temperature
    }

    pub fn humidity(&self) -> &MeasurementStats {
        &self.humidity
    }

    pub fn pressure(&self) -> &MeasurementStats {
        &self.pressure
    }

    pub fn battery_level(&self) -> &MeasurementStats {
        &self.battery_level
    }

    pub fn latest_event_time(&self) -> Option<DateTime<Utc>> {
        self.latest.as_ref().map(|latest| latest.event_time)
    }

    pub fn latest_status(&self) -> Option<&str> {
        self.latest
            .as_ref()
            .and_then(|latest| latest.status.as_deref())
    }
}

impl Aggregator<(), SensorReading, SensorAggregate> for SensorAccumulator {
    fn init(_: ()) -> Self {
        Self::default()
    }

    fn fold(mut self, reading: SensorReading) -> Self {
        if self.count == 0 {
            self.identity = Some(SensorIdentity::from(&reading));
        }
        self.count += 1;
        self.temperature = self.temperature.push(reading.temperature());
        self.humidity = self.humidity.push(reading.humidity());
        self.pressure = self.pressure.push(reading.pressure());
        self.battery_level = self.battery_level.push(reading.battery_level());

        let event_time = reading.event_time();
        let is_latest = match &self.latest {
            Some(latest) => event_time > latest.event_time,
            None => true,
        };
        if is_latest {
            self.latest = Some(LatestStatus {
                event_time,
                status: reading.status().map(str::to_string),
            });
        }
        self
    }

    /// Combines two partial accumulators of the same sensor and window.
    ///
    /// The sensor identity is taken from `self`. The latest status comes from
    /// the side with the later latest event time, `self` wins exact ties.
    fn merge(self, other: Self) -> Self {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        let latest = match (self.latest, other.latest) {
            (Some(a), Some(b)) => {
                if b.event_time > a.event_time {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };
        Self {
            identity: self.identity,
            count: self.count + other.count,
            temperature: self.temperature.merge(other.temperature),
            humidity: self.humidity.merge(other.humidity),
            pressure: self.pressure.merge(other.pressure),
            battery_level: self.battery_level.merge(other.battery_level),
            latest,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn finish(self, window: Window) -> SensorAggregate {
        let count = self.count;
        // The window store never finishes an empty accumulator
        let average = |stats: &MeasurementStats| stats.average(count).unwrap_or(f64::NAN);
        let identity = self.identity.unwrap_or_else(|| SensorIdentity {
            sensor_id: String::new(),
            sensor_type: None,
            location: None,
            metadata: Metadata::default(),
        });
        let (latest_event_time, latest_status) = match self.latest {
            Some(latest) => (Some(latest.event_time), latest.status),
            None => (None, None),
        };
        SensorAggregate {
            sensor_id: identity.sensor_id,
            sensor_type: identity.sensor_type,
            location: identity.location,
            window_start: window.start,
            window_end: window.end,
            count,
            avg_temperature: average(&self.temperature),
            min_temperature: self.temperature.min(),
            max_temperature: self.temperature.max(),
            avg_humidity: average(&self.humidity),
            min_humidity: self.humidity.min(),
            max_humidity: self.humidity.max(),
            avg_pressure: average(&self.pressure),
            min_pressure: self.pressure.min(),
            max_pressure: self.pressure.max(),
            avg_battery_level: average(&self.battery_level),
            min_battery_level: self.battery_level.min(),
            max_battery_level: self.battery_level.max(),
            latest_status,
            latest_event_time,
            metadata: identity.metadata,
        }
    }
}

/// Aggregated readings of one sensor over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAggregate {
    pub sensor_id: String,
    pub sensor_type: Option<String>,
    pub location: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Number of readings folded into this aggregate
    pub count: u64,
    pub avg_temperature: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub avg_humidity: f64,
    pub min_humidity: f64,
    pub max_humidity: f64,
    pub avg_pressure: f64,
    pub min_pressure: f64,
    pub max_pressure: f64,
    pub avg_battery_level: f64,
    pub min_battery_level: f64,
    pub max_battery_level: f64,
    pub latest_status: Option<String>,
    pub latest_event_time: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl SensorAggregate {
    pub fn window(&self) -> Window {
        Window::new(self.window_start, self.window_end)
    }
}

impl fmt::Display for SensorAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SensorAggregate{{sensorId={}, window=[{},{}), avgTemp={:.2}, avgHumidity={:.2}, avgPressure={:.2}, avgBattery={:.2}, status={}}}",
            self.sensor_id,
            self.window_start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.window_end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.avg_temperature,
            self.avg_humidity,
            self.avg_pressure,
            self.avg_battery_level,
            self.latest_status.as_deref().unwrap_or("null"),
        )
    }
}

#[cfg(test)]
mod tests;
