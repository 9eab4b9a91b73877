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

use super::*;
use chrono::TimeZone;
use sensoragg_analytics::{aggregation::WindowAggregator, window::TumblingWindows};
use sensoragg_reading::{decode_reading, FieldValue, TimestampValue};
use std::time::Duration;

fn ts(min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, min, sec).unwrap()
}

fn minute_window(min: u32) -> Window {
    Window::new(ts(min, 0), ts(min + 1, 0))
}

fn reading(sensor_id: &str, temperature: f64, status: &str, event_time: DateTime<Utc>) -> SensorReading {
    SensorReading::new(
        Some(sensor_id.to_string()),
        Some("environment".to_string()),
        Some("hall-a".to_string()),
        temperature,
        temperature * 2.0,
        1000.0 + temperature,
        100.0 - temperature,
        Some(status.to_string()),
        event_time,
        Metadata::new(
            Some("Acme".to_string()),
            Some("TH-1".to_string()),
            Some(format!("fw-{status}")),
            52.5,
            13.4,
        ),
    )
}

fn fold_all(readings: impl IntoIterator<Item = SensorReading>) -> SensorAccumulator {
    readings
        .into_iter()
        .fold(SensorAccumulator::init(()), SensorAccumulator::fold)
}

#[test]
fn test_measurement_stats_identity() {
    let stats = MeasurementStats::default();
    assert_eq!(stats.sum(), 0.0);
    assert_eq!(stats.min(), f64::INFINITY);
    assert_eq!(stats.max(), f64::NEG_INFINITY);
    assert_eq!(stats.average(0), None);

    let pushed = stats.push(-4.0).push(10.0);
    assert_eq!(pushed.merge(MeasurementStats::default()), pushed);
    assert_eq!(pushed.sum(), 6.0);
    assert_eq!(pushed.min(), -4.0);
    assert_eq!(pushed.max(), 10.0);
    assert_eq!(pushed.average(2), Some(3.0));
}

#[test]
fn test_fold_captures_identity_from_first_reading() {
    let accumulator = fold_all([
        reading("s1", 20.0, "first", ts(0, 30)),
        reading("s1", 30.0, "second", ts(0, 10)),
    ]);
    let aggregate = accumulator.finish(minute_window(0));
    assert_eq!(aggregate.sensor_id, "s1");
    assert_eq!(aggregate.sensor_type.as_deref(), Some("environment"));
    assert_eq!(aggregate.metadata.firmware(), Some("fw-first"));
    // The first reading is also the latest one
    assert_eq!(aggregate.latest_status.as_deref(), Some("first"));
    assert_eq!(aggregate.latest_event_time, Some(ts(0, 30)));
}

#[test]
fn test_fold_latest_status_requires_strictly_later_event() {
    let accumulator = fold_all([
        reading("s1", 20.0, "first", ts(0, 30)),
        reading("s1", 30.0, "same-time", ts(0, 30)),
    ]);
    assert_eq!(accumulator.latest_status(), Some("first"));

    let accumulator = accumulator.fold(reading("s1", 30.0, "later", ts(0, 31)));
    assert_eq!(accumulator.latest_status(), Some("later"));
    assert_eq!(accumulator.latest_event_time(), Some(ts(0, 31)));
}

#[test]
fn test_fold_is_order_independent() {
    let readings = [
        reading("s1", 20.0, "a", ts(0, 1)),
        reading("s1", -5.5, "b", ts(0, 2)),
        reading("s1", 31.25, "c", ts(0, 3)),
        reading("s1", 7.0, "d", ts(0, 4)),
    ];
    let forward = fold_all(readings.clone());
    let backward = fold_all(readings.iter().rev().cloned());
    let shuffled = fold_all([
        readings[2].clone(),
        readings[0].clone(),
        readings[3].clone(),
        readings[1].clone(),
    ]);
    for other in [&backward, &shuffled] {
        assert_eq!(forward.count(), other.count());
        assert_eq!(forward.temperature(), other.temperature());
        assert_eq!(forward.humidity(), other.humidity());
        assert_eq!(forward.pressure(), other.pressure());
        assert_eq!(forward.battery_level(), other.battery_level());
        assert_eq!(forward.latest_status(), other.latest_status());
    }
    assert_eq!(forward.temperature().min(), -5.5);
    assert_eq!(forward.temperature().max(), 31.25);
}

#[test]
fn test_merge_identity() {
    let a = fold_all([
        reading("s1", 20.0, "a", ts(0, 1)),
        reading("s1", 22.0, "b", ts(0, 2)),
    ]);
    let identity = SensorAccumulator::init(());
    assert!(identity.is_empty());
    assert_eq!(a.clone().merge(SensorAccumulator::init(())), a);
    assert_eq!(identity.merge(a.clone()), a);
}

#[test]
fn test_merge_counts_and_weighted_average() {
    let a = fold_all([
        reading("s1", 10.0, "a", ts(0, 1)),
        reading("s1", 20.0, "b", ts(0, 2)),
    ]);
    let b = fold_all([
        reading("s1", 40.0, "c", ts(0, 3)),
        reading("s1", 50.0, "d", ts(0, 4)),
        reading("s1", 60.0, "e", ts(0, 5)),
    ]);
    let a_avg = a.temperature().average(a.count()).unwrap();
    let b_avg = b.temperature().average(b.count()).unwrap();
    let weighted = (a_avg * a.count() as f64 + b_avg * b.count() as f64)
        / (a.count() + b.count()) as f64;

    let merged = a.merge(b);
    assert_eq!(merged.count(), 5);
    assert_eq!(merged.temperature().average(merged.count()), Some(weighted));
    assert_eq!(merged.temperature().min(), 10.0);
    assert_eq!(merged.temperature().max(), 60.0);
    assert_eq!(merged.latest_status(), Some("e"));
}

#[test]
fn test_merge_is_commutative_in_numbers() {
    let a = fold_all([reading("s1", 10.0, "a", ts(0, 10))]);
    let b = fold_all([reading("s1", 30.0, "b", ts(0, 5))]);
    let ab = a.clone().merge(b.clone());
    let ba = b.merge(a);
    assert_eq!(ab.temperature(), ba.temperature());
    assert_eq!(ab.pressure(), ba.pressure());
    assert_eq!(ab.count(), ba.count());
    // Latest status follows the later event time, whichever side it is on
    assert_eq!(ab.latest_status(), Some("a"));
    assert_eq!(ba.latest_status(), Some("a"));
}

#[test]
fn test_merge_tie_prefers_left_side() {
    let a = fold_all([reading("left", 10.0, "from-a", ts(0, 10))]);
    let b = fold_all([reading("right", 30.0, "from-b", ts(0, 10))]);
    let merged = a.merge(b);
    assert_eq!(merged.latest_status(), Some("from-a"));
    let aggregate = merged.finish(minute_window(0));
    assert_eq!(aggregate.sensor_id, "left");
    assert_eq!(aggregate.metadata.firmware(), Some("fw-from-a"));
}

#[test]
fn test_single_reading_round_trip() {
    let record = vec![
        FieldValue::Text("s9".to_string()),
        FieldValue::Null,
        FieldValue::Text("roof".to_string()),
        FieldValue::Text("18.5".to_string()),
        FieldValue::Integer(55),
        FieldValue::Float(1001.5),
        FieldValue::Float(93.0),
        FieldValue::Text("OK".to_string()),
        FieldValue::Timestamp(TimestampValue::PackedTimestamp {
            millis: ts(3, 20).timestamp_millis(),
            nanos_of_milli: 0,
        }),
        FieldValue::Null,
        FieldValue::Null,
        FieldValue::Null,
        FieldValue::Float(1.0),
        FieldValue::Float(2.0),
    ];
    let reading = decode_reading(&record).unwrap();
    let aggregate = SensorAccumulator::init(())
        .fold(reading)
        .finish(minute_window(3));

    assert_eq!(aggregate.count, 1);
    for (avg, min, max, value) in [
        (aggregate.avg_temperature, aggregate.min_temperature, aggregate.max_temperature, 18.5),
        (aggregate.avg_humidity, aggregate.min_humidity, aggregate.max_humidity, 55.0),
        (aggregate.avg_pressure, aggregate.min_pressure, aggregate.max_pressure, 1001.5),
        (
            aggregate.avg_battery_level,
            aggregate.min_battery_level,
            aggregate.max_battery_level,
            93.0,
        ),
    ] {
        assert_eq!(avg, value);
        assert_eq!(min, value);
        assert_eq!(max, value);
    }
    assert_eq!(aggregate.sensor_type, None);
    assert_eq!(aggregate.latest_event_time, Some(ts(3, 20)));
}

#[test]
fn test_minute_window_scenario() {
    let mut store = WindowAggregator::<String, (), SensorAccumulator>::new(
        TumblingWindows::new(Duration::from_secs(60)).unwrap(),
        Duration::from_secs(5),
        (),
    );
    // Reading A and B fall into [00:00, 00:01)
    let processed = store.process_item(reading("s1", 20.0, "A", ts(0, 10)));
    assert!(processed.fired.is_empty());
    let processed = store.process_item(reading("s1", 30.0, "B", ts(0, 50)));
    assert!(processed.fired.is_empty());

    // Reading C moves the watermark to 00:01:00 and closes the first window
    let processed = store.process_item(reading("s1", 10.0, "C", ts(1, 5)));
    assert!(processed.late.is_none());
    assert_eq!(processed.fired.len(), 1);
    let fired = &processed.fired[0];
    assert_eq!(fired.key, "s1");
    assert_eq!(fired.window, minute_window(0));
    let aggregate = &fired.value;
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.avg_temperature, 25.0);
    assert_eq!(aggregate.min_temperature, 20.0);
    assert_eq!(aggregate.max_temperature, 30.0);
    assert_eq!(aggregate.latest_status.as_deref(), Some("B"));
    assert_eq!(aggregate.window(), minute_window(0));

    // Reading C started the next window
    assert_eq!(store.open_windows(), 1);
    let flushed = store.flush();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].window, minute_window(1));
    assert_eq!(flushed[0].value.count, 1);
    assert_eq!(flushed[0].value.avg_temperature, 10.0);
}

#[test]
fn test_missing_sensor_id_uses_empty_key() {
    let mut anonymous = reading("ignored", 1.0, "OK", ts(0, 1));
    anonymous = SensorReading::new(
        None,
        anonymous.sensor_type().map(str::to_string),
        anonymous.location().map(str::to_string),
        anonymous.temperature(),
        anonymous.humidity(),
        anonymous.pressure(),
        anonymous.battery_level(),
        anonymous.status().map(str::to_string),
        anonymous.event_time(),
        anonymous.metadata().clone(),
    );
    let aggregate = SensorAccumulator::init(())
        .fold(anonymous)
        .finish(minute_window(0));
    assert_eq!(aggregate.sensor_id, "");
}

#[test]
fn test_display_format() {
    let aggregate = fold_all([
        reading("s1", 20.0, "OK", ts(0, 10)),
        reading("s1", 21.0, "WARN", ts(0, 20)),
    ])
    .finish(minute_window(0));
    assert_eq!(
        aggregate.to_string(),
        "SensorAggregate{sensorId=s1, window=[2025-01-01T00:00:00Z,2025-01-01T00:01:00Z), \
         avgTemp=20.50, avgHumidity=41.00, avgPressure=1020.50, avgBattery=79.50, status=WARN}"
    );
}

#[test]
fn test_json_encoding() {
    let aggregate = fold_all([reading("s1", 20.0, "OK", ts(0, 10))]).finish(minute_window(0));
    let value = serde_json::to_value(&aggregate).unwrap();
    assert_eq!(value["sensor_id"], "s1");
    assert_eq!(value["window_start"], "2025-01-01T00:00:00Z");
    assert_eq!(value["window_end"], "2025-01-01T00:01:00Z");
    assert_eq!(value["count"], 1);
    assert_eq!(value["latest_status"], "OK");
    let decoded: SensorAggregate = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, aggregate);
}
