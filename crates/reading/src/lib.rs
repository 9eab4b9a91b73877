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

//! Sensor reading data model.
//!
//! A [`SensorReading`] is produced once by the decoder in [`decode`] and is
//! never mutated afterwards, all fields are read through accessors.

use chrono::{DateTime, Utc};
use sensoragg_analytics::aggregation::TimeSeriesData;
use serde::{Deserialize, Serialize};

pub mod decode;

pub use decode::{decode_json_record, decode_reading, DecodeError, FieldValue, TimestampValue};

/// Device description attached to every reading
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    manufacturer: Option<String>,
    model: Option<String>,
    firmware: Option<String>,
    latitude: f64,
    longitude: f64,
}

impl Metadata {
    pub const fn new(
        manufacturer: Option<String>,
        model: Option<String>,
        firmware: Option<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            manufacturer,
            model,
            firmware,
            latitude,
            longitude,
        }
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    pub const fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Four measurements taken by one sensor at one point in event time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    sensor_id: Option<String>,
    sensor_type: Option<String>,
    location: Option<String>,
    temperature: f64,
    humidity: f64,
    pressure: f64,
    battery_level: f64,
    status: Option<String>,
    event_time: DateTime<Utc>,
    metadata: Metadata,
}

impl SensorReading {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        sensor_id: Option<String>,
        sensor_type: Option<String>,
        location: Option<String>,
        temperature: f64,
        humidity: f64,
        pressure: f64,
        battery_level: f64,
        status: Option<String>,
        event_time: DateTime<Utc>,
        metadata: Metadata,
    ) -> Self {
        Self {
            sensor_id,
            sensor_type,
            location,
            temperature,
            humidity,
            pressure,
            battery_level,
            status,
            event_time,
            metadata,
        }
    }

    pub fn sensor_id(&self) -> Option<&str> {
        self.sensor_id.as_deref()
    }

    /// Key used for partitioning and windowing, a missing sensor id is keyed
    /// by the empty string
    pub fn key(&self) -> &str {
        self.sensor_id.as_deref().unwrap_or_default()
    }

    pub fn sensor_type(&self) -> Option<&str> {
        self.sensor_type.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub const fn temperature(&self) -> f64 {
        self.temperature
    }

    pub const fn humidity(&self) -> f64 {
        self.humidity
    }

    pub const fn pressure(&self) -> f64 {
        self.pressure
    }

    pub const fn battery_level(&self) -> f64 {
        self.battery_level
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub const fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl TimeSeriesData<String> for SensorReading {
    fn get_key(&self) -> String {
        self.key().to_string()
    }

    fn get_ts(&self) -> DateTime<Utc> {
        self.event_time
    }
}
