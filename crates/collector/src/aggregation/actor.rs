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

//! Actor-based windowed aggregation of sensor readings.
//!
//! This module provides the actor implementation for one key partition:
//! - `AggregationActor` - Core actor that folds readings of its partition into
//!   tumbling windows and emits an aggregate per sensor and window
//! - `AggregationActorHandle` - Handle for controlling and communicating with
//!   the actor
//! - `AggregationStats` - Metrics collection for aggregation operations
//!
//! Each actor owns its accumulators exclusively and keeps its own watermark,
//! which it publishes on a `watch` channel. Consumers fed by several
//! partitions use [`combined_watermark`].
//!
//! Shutdown is graceful: the actor stops accepting readings, folds what is
//! already queued, fires every open window regardless of the watermark and
//! only then terminates.

use crate::{
    aggregation::{aggregator::SensorAccumulator, config::AggregationConfig, SensorAggregate},
    config::ConfigurationError,
};
use chrono::{DateTime, Utc};
use either::Either;
use opentelemetry::metrics::{Counter, Meter};
use sensoragg_analytics::{
    aggregation::{Fired, WindowAggregator},
    watermark::combine_watermarks,
    window::TumblingWindows,
};
use sensoragg_reading::SensorReading;
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AggregationStats {
    pub received_readings: Counter<u64>,
    pub late_readings: Counter<u64>,
    pub emitted_aggregates: Counter<u64>,
    pub send_error: Counter<u64>,
}

impl AggregationStats {
    pub fn new(meter: Meter) -> Self {
        let received_readings = meter
            .u64_counter("sensoragg.collector.aggregation.received.readings")
            .with_description("Number of sensor readings received for aggregation")
            .build();
        let late_readings = meter
            .u64_counter("sensoragg.collector.aggregation.late.readings")
            .with_description("Number of readings that arrived after their window fired")
            .build();
        let emitted_aggregates = meter
            .u64_counter("sensoragg.collector.aggregation.emitted.aggregates")
            .with_description("Number of window aggregates emitted")
            .build();
        let send_error = meter
            .u64_counter("sensoragg.collector.aggregation.send.error")
            .with_description("Number of aggregates that could not be handed to the publisher")
            .build();
        Self {
            received_readings,
            late_readings,
            emitted_aggregates,
            send_error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AggregationCommand {
    Shutdown,
}

#[derive(Debug)]
struct AggregationActor {
    cmd_recv: mpsc::Receiver<AggregationCommand>,
    rx: async_channel::Receiver<SensorReading>,
    tx: async_channel::Sender<SensorAggregate>,
    watermark_tx: watch::Sender<Option<DateTime<Utc>>>,
    windows: TumblingWindows,
    bounded_delay: Duration,
    stats: AggregationStats,
    shard_id: usize,
}

impl AggregationActor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        cmd_recv: mpsc::Receiver<AggregationCommand>,
        rx: async_channel::Receiver<SensorReading>,
        tx: async_channel::Sender<SensorAggregate>,
        watermark_tx: watch::Sender<Option<DateTime<Utc>>>,
        windows: TumblingWindows,
        bounded_delay: Duration,
        stats: AggregationStats,
        shard_id: usize,
    ) -> Self {
        Self {
            cmd_recv,
            rx,
            tx,
            watermark_tx,
            windows,
            bounded_delay,
            stats,
            shard_id,
        }
    }

    async fn emit(
        &self,
        fired: Vec<Fired<String, SensorAggregate>>,
        tags: &[opentelemetry::KeyValue],
    ) {
        for fired in fired {
            self.stats.emitted_aggregates.add(1, tags);
            debug!("Window {} fired for sensor `{}`", fired.window, fired.key);
            if let Err(err) = self.tx.send(fired.value).await {
                warn!("AggregationActor of shard {} send error: {err}", self.shard_id);
                self.stats.send_error.add(1, tags);
            }
        }
    }

    fn publish_watermark(&self, watermark: Option<DateTime<Utc>>) {
        self.watermark_tx.send_if_modified(|current| {
            if *current == watermark {
                false
            } else {
                *current = watermark;
                true
            }
        });
    }

    async fn run(mut self) -> anyhow::Result<String> {
        let tags = [opentelemetry::KeyValue::new(
            "shard_id",
            opentelemetry::Value::I64(self.shard_id as i64),
        )];
        let mut aggregator = WindowAggregator::<String, (), SensorAccumulator>::new(
            self.windows,
            self.bounded_delay,
            (),
        );

        info!(
            "Starting AggregationActor for shard {} with {:?} windows and {:?} bounded delay",
            self.shard_id,
            self.windows.size(),
            self.bounded_delay
        );
        let mut draining = false;
        loop {
            tokio::select! {
                biased;
                cmd_recv = self.cmd_recv.recv(), if !draining => {
                    match cmd_recv {
                        Some(AggregationCommand::Shutdown) => {
                            info!("Received shutdown command, flushing open windows of shard {}", self.shard_id);
                        }
                        None => {
                            info!("Command channel closed, flushing open windows of shard {}", self.shard_id);
                        }
                    }
                    // Queued readings are still delivered before recv reports the closure
                    self.rx.close();
                    draining = true;
                }
                reading = self.rx.recv() => {
                    match reading {
                        Ok(reading) => {
                            self.stats.received_readings.add(1, &tags);
                            let processed =
                                aggregator.process_item::<SensorReading, SensorAggregate>(reading);
                            if let Some(late) = processed.late {
                                self.stats.late_readings.add(1, &tags);
                                warn!(
                                    "Late reading for sensor `{}` at {}: its window already fired",
                                    late.key(),
                                    late.event_time()
                                );
                            }
                            self.emit(processed.fired, &tags).await;
                            self.publish_watermark(aggregator.watermark());
                        }
                        Err(_) => {
                            let flushed = aggregator.flush::<SensorReading, SensorAggregate>();
                            self.emit(flushed, &tags).await;
                            self.publish_watermark(aggregator.watermark());
                            info!("Readings channel closed, AggregationActor of shard {} flushed all windows", self.shard_id);
                            return Ok("Aggregation terminated successfully".to_string());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum AggregationActorHandleError {
    SendError,
}

impl std::fmt::Display for AggregationActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to the aggregation actor"),
        }
    }
}

impl std::error::Error for AggregationActorHandleError {}

#[derive(Debug, Clone)]
pub struct AggregationActorHandle {
    cmd_send: mpsc::Sender<AggregationCommand>,
    rx: async_channel::Receiver<SensorAggregate>,
    watermark_rx: watch::Receiver<Option<DateTime<Utc>>>,
    shard_id: usize,
}

impl AggregationActorHandle {
    pub fn new(
        buffer_size: usize,
        config: AggregationConfig,
        readings_rx: async_channel::Receiver<SensorReading>,
        stats: Either<Meter, AggregationStats>,
        shard_id: usize,
    ) -> Result<(JoinHandle<anyhow::Result<String>>, Self), ConfigurationError> {
        let windows = config.windows()?;
        let (cmd_send, cmd_recv) = mpsc::channel(10);
        let (tx, rx) = async_channel::bounded(buffer_size.max(1));
        let (watermark_tx, watermark_rx) = watch::channel(None);
        let stats = match stats {
            Either::Left(meter) => AggregationStats::new(meter),
            Either::Right(stats) => stats,
        };
        let actor = AggregationActor::new(
            cmd_recv,
            readings_rx,
            tx,
            watermark_tx,
            windows,
            config.bounded_delay(),
            stats,
            shard_id,
        );
        let join_handle = tokio::spawn(actor.run());
        let handle = Self {
            cmd_send,
            rx,
            watermark_rx,
            shard_id,
        };
        Ok((join_handle, handle))
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Graceful shutdown, open windows are flushed before the actor exits
    pub async fn shutdown(&self) -> Result<(), AggregationActorHandleError> {
        self.cmd_send
            .send(AggregationCommand::Shutdown)
            .await
            .map_err(|_| AggregationActorHandleError::SendError)
    }

    /// Aggregates of this shard, in emission order
    pub fn subscribe(&self) -> async_channel::Receiver<SensorAggregate> {
        self.rx.clone()
    }

    pub fn watermark(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.watermark_rx.clone()
    }

    pub fn current_watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark_rx.borrow()
    }
}

/// Watermark of a consumer fed by all the given shards
pub fn combined_watermark(handles: &[AggregationActorHandle]) -> Option<DateTime<Utc>> {
    combine_watermarks(handles.iter().map(AggregationActorHandle::current_watermark))
}

#[cfg(test)]
mod tests;
