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

//! Decoder for positional sensor records.
//!
//! A record is a sequence of at least 14 typed values in the order given by
//! [`ReadingField`]. Trailing values beyond the 14th are ignored.
//!
//! On the wire (see [`decode_json_record`]) a record is a JSON array. Plain
//! JSON scalars map onto [`FieldValue`] directly, event times are tagged
//! objects:
//! ```text
//! {"native_instant": "2025-01-01T00:00:10Z"}
//! {"packed_timestamp": {"millis": 1735689610000, "nanos_of_milli": 0}}
//! {"legacy_date_time": "2025-01-01T00:00:10"}
//! ```

use crate::{Metadata, SensorReading};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Positions of the fields in a sensor record
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReadingField {
    SensorId,
    SensorType,
    Location,
    Temperature,
    Humidity,
    Pressure,
    BatteryLevel,
    Status,
    EventTime,
    Manufacturer,
    Model,
    Firmware,
    Latitude,
    Longitude,
}

impl ReadingField {
    pub const ALL: [ReadingField; 14] = [
        ReadingField::SensorId,
        ReadingField::SensorType,
        ReadingField::Location,
        ReadingField::Temperature,
        ReadingField::Humidity,
        ReadingField::Pressure,
        ReadingField::BatteryLevel,
        ReadingField::Status,
        ReadingField::EventTime,
        ReadingField::Manufacturer,
        ReadingField::Model,
        ReadingField::Firmware,
        ReadingField::Latitude,
        ReadingField::Longitude,
    ];

    /// Minimum number of values a record must carry
    pub const COUNT: usize = Self::ALL.len();

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Temporal representations accepted for the event time field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampValue {
    /// An instant on the UTC time line
    NativeInstant(DateTime<Utc>),
    /// Milliseconds since the epoch plus a sub-millisecond nanosecond part
    PackedTimestamp { millis: i64, nanos_of_milli: u32 },
    /// Wall clock date-time without zone, read as UTC
    LegacyDateTime(NaiveDateTime),
}

impl TimestampValue {
    /// Convert to an instant truncated to millisecond resolution
    pub fn to_instant(&self) -> Result<DateTime<Utc>, DecodeError> {
        let millis = match self {
            Self::NativeInstant(ts) => ts.timestamp_millis(),
            Self::PackedTimestamp {
                millis,
                nanos_of_milli,
            } => {
                if *nanos_of_milli >= 1_000_000 {
                    return Err(DecodeError::PackedTimestampOutOfRange {
                        millis: *millis,
                        nanos_of_milli: *nanos_of_milli,
                    });
                }
                *millis
            }
            Self::LegacyDateTime(dt) => dt.and_utc().timestamp_millis(),
        };
        DateTime::from_timestamp_millis(millis).ok_or(DecodeError::PackedTimestampOutOfRange {
            millis,
            nanos_of_milli: 0,
        })
    }
}

impl fmt::Display for TimestampValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeInstant(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::PackedTimestamp {
                millis,
                nanos_of_milli,
            } => write!(f, "{millis}ms+{nanos_of_milli}ns"),
            Self::LegacyDateTime(dt) => write!(f, "{dt}"),
        }
    }
}

/// One typed value of a positional record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(TimestampValue),
}

impl FieldValue {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Timestamp(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record has {actual} fields, expected at least {expected}")]
    TooFewFields { expected: usize, actual: usize },

    #[error("field `{field}` is not a number: `{value}`")]
    InvalidNumber { field: ReadingField, value: String },

    #[error("unsupported timestamp type in field `{field}`: {found}")]
    UnsupportedTimestamp { field: ReadingField, found: String },

    #[error("timestamp {millis} ms (+{nanos_of_milli} ns) is out of range")]
    PackedTimestampOutOfRange { millis: i64, nanos_of_milli: u32 },

    #[error("malformed JSON record: {0}")]
    Json(#[from] serde_json::Error),
}

fn decode_string(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::Text(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn decode_number(field: ReadingField, value: &FieldValue) -> Result<f64, DecodeError> {
    let number = match value {
        FieldValue::Null => 0.0,
        FieldValue::Integer(value) => *value as f64,
        FieldValue::Float(value) => *value,
        FieldValue::Text(text) => {
            text.trim()
                .parse::<f64>()
                .map_err(|_| DecodeError::InvalidNumber {
                    field,
                    value: text.clone(),
                })?
        }
        other @ (FieldValue::Bool(_) | FieldValue::Timestamp(_)) => {
            return Err(DecodeError::InvalidNumber {
                field,
                value: other.to_string(),
            });
        }
    };
    // NaN and infinities have no JSON representation in the emitted aggregates
    if !number.is_finite() {
        return Err(DecodeError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    Ok(number)
}

fn decode_event_time(field: ReadingField, value: &FieldValue) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        FieldValue::Timestamp(ts) => ts.to_instant(),
        other => Err(DecodeError::UnsupportedTimestamp {
            field,
            found: format!("{} `{other}`", other.kind()),
        }),
    }
}

/// Decode a positional record into a [`SensorReading`].
///
/// Null numeric values decode as `0.0`, null strings as absent values. Text
/// in a numeric position is parsed as a decimal number. NaN and infinite
/// values are rejected.
pub fn decode_reading(fields: &[FieldValue]) -> Result<SensorReading, DecodeError> {
    if fields.len() < ReadingField::COUNT {
        return Err(DecodeError::TooFewFields {
            expected: ReadingField::COUNT,
            actual: fields.len(),
        });
    }
    let string = |field: ReadingField| decode_string(&fields[field.index()]);
    let number = |field: ReadingField| decode_number(field, &fields[field.index()]);

    let metadata = Metadata::new(
        string(ReadingField::Manufacturer),
        string(ReadingField::Model),
        string(ReadingField::Firmware),
        number(ReadingField::Latitude)?,
        number(ReadingField::Longitude)?,
    );
    Ok(SensorReading::new(
        string(ReadingField::SensorId),
        string(ReadingField::SensorType),
        string(ReadingField::Location),
        number(ReadingField::Temperature)?,
        number(ReadingField::Humidity)?,
        number(ReadingField::Pressure)?,
        number(ReadingField::BatteryLevel)?,
        string(ReadingField::Status),
        decode_event_time(
            ReadingField::EventTime,
            &fields[ReadingField::EventTime.index()],
        )?,
        metadata,
    ))
}

/// Decode a record serialized as a JSON array of field values
pub fn decode_json_record(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    let fields: Vec<FieldValue> = serde_json::from_slice(payload)?;
    decode_reading(&fields)
}
