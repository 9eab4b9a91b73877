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

//! Publisher writing each aggregate to the log in its human-readable form.

use crate::aggregation::SensorAggregate;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LogPublisherStats {
    received: opentelemetry::metrics::Counter<u64>,
}

impl LogPublisherStats {
    pub fn new(meter: opentelemetry::metrics::Meter) -> Self {
        let received = meter
            .u64_counter("sensoragg.collector.publisher.log.received")
            .with_description("Aggregates written to the log")
            .build();
        Self { received }
    }
}

pub(crate) fn log_aggregate(aggregate: &SensorAggregate) {
    info!("{aggregate}");
}

#[derive(Debug, Clone, Copy)]
enum LogPublisherActorCommand {
    Shutdown,
}

struct LogPublisherActor {
    cmd_rx: mpsc::Receiver<LogPublisherActorCommand>,
    msg_recv: async_channel::Receiver<SensorAggregate>,
    stats: LogPublisherStats,
    shard_id: usize,
}

impl LogPublisherActor {
    async fn run(mut self) -> anyhow::Result<String> {
        let tags = [opentelemetry::KeyValue::new(
            "shard_id",
            opentelemetry::Value::I64(self.shard_id as i64),
        )];
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(LogPublisherActorCommand::Shutdown) => {
                            info!("Log publisher of shard {} received shutdown signal", self.shard_id);
                            return Ok("Log publisher shutdown".to_string());
                        }
                        None => {
                            warn!("Log publisher of shard {} command channel closed, waiting for upstream", self.shard_id);
                            // Keep publishing until the shard closes its channel
                            while let Ok(aggregate) = self.msg_recv.recv().await {
                                self.stats.received.add(1, &tags);
                                log_aggregate(&aggregate);
                            }
                            return Ok("Log publisher finished, upstream closed".to_string());
                        }
                    }
                }
                msg = self.msg_recv.recv() => {
                    match msg {
                        Ok(aggregate) => {
                            self.stats.received.add(1, &tags);
                            log_aggregate(&aggregate);
                        }
                        Err(_) => {
                            info!("Log publisher of shard {} finished, upstream closed", self.shard_id);
                            return Ok("Log publisher finished, upstream closed".to_string());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum LogPublisherActorHandleError {
    SendError,
}

impl std::fmt::Display for LogPublisherActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to the log publisher"),
        }
    }
}

impl std::error::Error for LogPublisherActorHandleError {}

#[derive(Debug)]
pub struct LogPublisherActorHandle {
    cmd_tx: mpsc::Sender<LogPublisherActorCommand>,
}

impl LogPublisherActorHandle {
    pub fn new(
        msg_recv: async_channel::Receiver<SensorAggregate>,
        stats: either::Either<opentelemetry::metrics::Meter, LogPublisherStats>,
        shard_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let stats = match stats {
            either::Either::Left(meter) => LogPublisherStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = LogPublisherActor {
            cmd_rx,
            msg_recv,
            stats,
            shard_id,
        };
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_tx })
    }

    pub async fn shutdown(&self) -> Result<(), LogPublisherActorHandleError> {
        self.cmd_tx
            .send(LogPublisherActorCommand::Shutdown)
            .await
            .map_err(|_| LogPublisherActorHandleError::SendError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sensoragg_reading::Metadata;
    use tracing_test::traced_test;

    fn aggregate(sensor_id: &str, status: Option<&str>) -> SensorAggregate {
        SensorAggregate {
            sensor_id: sensor_id.to_string(),
            sensor_type: None,
            location: None,
            window_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap(),
            count: 1,
            avg_temperature: 21.0,
            min_temperature: 21.0,
            max_temperature: 21.0,
            avg_humidity: 40.0,
            min_humidity: 40.0,
            max_humidity: 40.0,
            avg_pressure: 1013.25,
            min_pressure: 1013.25,
            max_pressure: 1013.25,
            avg_battery_level: 77.5,
            min_battery_level: 77.5,
            max_battery_level: 77.5,
            latest_status: status.map(str::to_string),
            latest_event_time: None,
            metadata: Metadata::default(),
        }
    }

    #[test]
    #[traced_test]
    fn test_log_aggregate_uses_display_form() {
        log_aggregate(&aggregate("s9", None));
        assert!(logs_contain(
            "SensorAggregate{sensorId=s9, window=[2025-01-01T00:00:00Z,2025-01-01T00:01:00Z), avgTemp=21.00, avgHumidity=40.00, avgPressure=1013.25, avgBattery=77.50, status=null}"
        ));
    }

    #[tokio::test]
    async fn test_publisher_finishes_when_upstream_closes() {
        let (tx, rx) = async_channel::bounded(4);
        let (join_handle, _handle) = LogPublisherActorHandle::new(
            rx,
            either::Left(opentelemetry::global::meter("sensoragg-test")),
            0,
        );
        tx.send(aggregate("s1", Some("OK"))).await.unwrap();
        tx.send(aggregate("s2", Some("WARN"))).await.unwrap();
        drop(tx);
        let result = join_handle.await.unwrap();
        assert_eq!(result.unwrap(), "Log publisher finished, upstream closed");
    }

    #[tokio::test]
    async fn test_publisher_shutdown() {
        let (_tx, rx) = async_channel::bounded::<SensorAggregate>(4);
        let (join_handle, handle) = LogPublisherActorHandle::new(
            rx,
            either::Left(opentelemetry::global::meter("sensoragg-test")),
            0,
        );
        handle.shutdown().await.unwrap();
        let result = join_handle.await.unwrap();
        assert_eq!(result.unwrap(), "Log publisher shutdown");
    }
}
