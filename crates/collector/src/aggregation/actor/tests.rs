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
use sensoragg_reading::Metadata;

fn ts(min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, min, sec).unwrap()
}

fn reading(sensor_id: &str, temperature: f64, event_time: DateTime<Utc>) -> SensorReading {
    SensorReading::new(
        Some(sensor_id.to_string()),
        Some("environment".to_string()),
        None,
        temperature,
        50.0,
        1013.0,
        90.0,
        Some("OK".to_string()),
        event_time,
        Metadata::default(),
    )
}

fn spawn_shard(
    shard_id: usize,
) -> (
    JoinHandle<anyhow::Result<String>>,
    AggregationActorHandle,
    async_channel::Sender<SensorReading>,
) {
    let (readings_tx, readings_rx) = async_channel::bounded(100);
    let meter = opentelemetry::global::meter("sensoragg-test");
    let (join_handle, handle) = AggregationActorHandle::new(
        100,
        AggregationConfig::default(),
        readings_rx,
        Either::Left(meter),
        shard_id,
    )
    .unwrap();
    (join_handle, handle, readings_tx)
}

async fn collect(rx: async_channel::Receiver<SensorAggregate>) -> Vec<SensorAggregate> {
    let mut aggregates = vec![];
    while let Ok(aggregate) = rx.recv().await {
        aggregates.push(aggregate);
    }
    aggregates
}

#[tokio::test]
async fn test_windows_fire_as_watermark_passes_and_rest_flush_on_close() {
    let (join_handle, handle, readings_tx) = spawn_shard(0);
    let rx = handle.subscribe();

    readings_tx.send(reading("s1", 20.0, ts(0, 10))).await.unwrap();
    readings_tx.send(reading("s1", 21.0, ts(0, 50))).await.unwrap();
    readings_tx.send(reading("s1", 22.0, ts(1, 5))).await.unwrap();

    // ts(1, 5) minus 5 seconds of bounded delay closes the first window
    let first = rx.recv().await.unwrap();
    assert_eq!(first.window_start, ts(0, 0));
    assert_eq!(first.count, 2);
    assert_eq!(first.avg_temperature, 20.5);

    drop(readings_tx);
    drop(handle);
    let rest = collect(rx).await;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].window_start, ts(1, 0));
    assert_eq!(rest[0].count, 1);
    assert_eq!(rest[0].max_temperature, 22.0);

    let result = join_handle.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_shutdown_flushes_open_windows() {
    let (join_handle, handle, readings_tx) = spawn_shard(0);
    let rx = handle.subscribe();

    readings_tx.send(reading("s1", 10.0, ts(0, 10))).await.unwrap();
    readings_tx.send(reading("s2", 30.0, ts(0, 20))).await.unwrap();
    readings_tx.send(reading("s1", 12.0, ts(2, 0))).await.unwrap();
    handle.shutdown().await.unwrap();
    drop(handle);

    let aggregates = collect(rx).await;
    let emitted: Vec<_> = aggregates
        .iter()
        .map(|aggregate| (aggregate.window_start, aggregate.sensor_id.as_str(), aggregate.count))
        .collect();
    assert_eq!(
        emitted,
        vec![(ts(0, 0), "s1", 1), (ts(0, 0), "s2", 1), (ts(2, 0), "s1", 1)]
    );
    assert!(join_handle.await.unwrap().is_ok());

    // The actor stopped accepting readings
    assert!(readings_tx.send(reading("s1", 1.0, ts(3, 0))).await.is_err());
}

#[tokio::test]
async fn test_late_reading_is_not_emitted() {
    let (join_handle, handle, readings_tx) = spawn_shard(0);
    let rx = handle.subscribe();

    readings_tx.send(reading("s1", 20.0, ts(0, 10))).await.unwrap();
    readings_tx.send(reading("s1", 40.0, ts(1, 30))).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.window_start, ts(0, 0));
    assert_eq!(first.count, 1);

    // Window [00:00, 00:01) already fired
    readings_tx.send(reading("s1", 99.0, ts(0, 20))).await.unwrap();
    drop(readings_tx);
    drop(handle);

    let rest = collect(rx).await;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].window_start, ts(1, 0));
    assert_eq!(rest[0].count, 1);
    assert_eq!(rest[0].avg_temperature, 40.0);
    assert!(join_handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_watermark_published_for_reading_that_fires_nothing() {
    let (_join_handle, handle, readings_tx) = spawn_shard(0);
    let mut watermark = handle.watermark();
    assert_eq!(handle.current_watermark(), None);

    readings_tx.send(reading("s1", 20.0, ts(3, 0))).await.unwrap();
    let observed = *tokio::time::timeout(
        Duration::from_secs(5),
        watermark.wait_for(|w| w.is_some()),
    )
    .await
    .expect("watermark was not published")
    .unwrap();
    assert_eq!(observed, Some(ts(2, 55)));
    assert_eq!(handle.current_watermark(), Some(ts(2, 55)));

    // The reading is still held in its open window
    assert!(handle.subscribe().try_recv().is_err());
}

#[tokio::test]
async fn test_combined_watermark_is_held_back_by_slowest_shard() {
    let (_join_0, shard_0, tx_0) = spawn_shard(0);
    let (_join_1, shard_1, tx_1) = spawn_shard(1);
    let handles = vec![shard_0.clone(), shard_1.clone()];
    assert_eq!(combined_watermark(&handles), None);

    tx_0.send(reading("s1", 20.0, ts(3, 0))).await.unwrap();
    let mut watermark_0 = shard_0.watermark();
    watermark_0.wait_for(|w| w.is_some()).await.unwrap();
    assert_eq!(shard_0.current_watermark(), Some(ts(2, 55)));
    // Shard 1 has not observed anything yet
    assert_eq!(combined_watermark(&handles), None);

    tx_1.send(reading("s2", 20.0, ts(1, 5))).await.unwrap();
    let mut watermark_1 = shard_1.watermark();
    watermark_1.wait_for(|w| w.is_some()).await.unwrap();
    assert_eq!(combined_watermark(&handles), Some(ts(1, 0)));
}

#[tokio::test]
async fn test_invalid_window_size_is_rejected() {
    let (_readings_tx, readings_rx) = async_channel::bounded(1);
    let config = AggregationConfig {
        window_size_minutes: 0,
        ..Default::default()
    };
    let result = AggregationActorHandle::new(
        1,
        config,
        readings_rx,
        Either::Left(opentelemetry::global::meter("sensoragg-test")),
        0,
    );
    assert!(matches!(result, Err(ConfigurationError::InvalidWindowSize)));
}
