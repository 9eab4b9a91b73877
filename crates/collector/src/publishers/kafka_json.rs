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

use crate::{aggregation::SensorAggregate, publishers::LoggingProducerContext};
use rdkafka::{
    config::{ClientConfig, FromClientConfigAndContext},
    error::{KafkaError, RDKafkaErrorCode},
    producer::{BaseRecord, Producer, ThreadedProducer},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// --- config ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    /// Output topic
    pub topic: String,
    /// Key/Value producer configs are defined in librdkafka
    #[serde(default)]
    pub producer_config: HashMap<String, String>,
}

// --- telemetry ---

#[derive(Debug, Clone)]
pub struct KafkaJsonPublisherStats {
    received: opentelemetry::metrics::Counter<u64>,
    sent: opentelemetry::metrics::Counter<u64>,
    send_retries: opentelemetry::metrics::Counter<u64>,
    error_encode: opentelemetry::metrics::Counter<u64>,
    error_send: opentelemetry::metrics::Counter<u64>,
    delivered: opentelemetry::metrics::Counter<u64>,
    failed_delivery: opentelemetry::metrics::Counter<u64>,
}

impl KafkaJsonPublisherStats {
    pub fn new(meter: opentelemetry::metrics::Meter) -> Self {
        let received = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.received")
            .with_description("Received aggregates from the aggregation shard")
            .build();
        let sent = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.sent")
            .with_description("Number of aggregates handed to librdkafka")
            .build();
        let send_retries = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.send.retries")
            .with_description("Number of send retries to Kafka due to full queue in librdkafka")
            .build();
        let error_encode = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.error_encode")
            .with_description("Error encoding an aggregate into JSON")
            .build();
        let error_send = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.error_send")
            .with_description("Error sending an aggregate to Kafka")
            .build();
        let delivered = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.delivered")
            .with_description("Aggregates acknowledged by the Kafka brokers")
            .build();
        let failed_delivery = meter
            .u64_counter("sensoragg.collector.publisher.kafka.json.failed_delivery")
            .with_description("Aggregates the Kafka brokers failed to acknowledge")
            .build();
        Self {
            received,
            sent,
            send_retries,
            error_encode,
            error_send,
            delivered,
            failed_delivery,
        }
    }
}

// --- actor ---

#[derive(Debug)]
pub enum KafkaJsonPublisherActorError {
    KafkaError(KafkaError),
    SerializationError(String),
}

impl std::fmt::Display for KafkaJsonPublisherActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KafkaError(e) => write!(f, "Kafka error: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for KafkaJsonPublisherActorError {}

impl From<KafkaError> for KafkaJsonPublisherActorError {
    fn from(e: KafkaError) -> Self {
        Self::KafkaError(e)
    }
}

impl From<serde_json::Error> for KafkaJsonPublisherActorError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

/// JSON value of an aggregate, window bounds in RFC 3339
pub fn encode_aggregate(
    aggregate: &SensorAggregate,
) -> Result<Vec<u8>, KafkaJsonPublisherActorError> {
    Ok(serde_json::to_vec(aggregate)?)
}

#[derive(Debug, Clone, Copy)]
enum KafkaJsonPublisherActorCommand {
    Shutdown,
}

struct KafkaJsonPublisherActor {
    cmd_rx: mpsc::Receiver<KafkaJsonPublisherActorCommand>,

    /// Configured kafka options
    config: KafkaConfig,

    /// librdkafka producer
    producer: ThreadedProducer<LoggingProducerContext>,

    msg_recv: async_channel::Receiver<SensorAggregate>,

    stats: KafkaJsonPublisherStats,

    otel_tags: Box<[opentelemetry::KeyValue]>,
}

impl KafkaJsonPublisherActor {
    fn get_producer(
        config: &KafkaConfig,
        context: LoggingProducerContext,
    ) -> Result<ThreadedProducer<LoggingProducerContext>, KafkaJsonPublisherActorError> {
        let mut producer_config = ClientConfig::new();
        for (k, v) in &config.producer_config {
            producer_config.set(k.as_str(), v.as_str());
        }
        match ThreadedProducer::from_config_and_context(&producer_config, context) {
            Ok(p) => Ok(p),
            Err(err) => {
                error!("Failed to create Kafka producer: {err}");
                Err(err)?
            }
        }
    }

    fn from_config(
        cmd_rx: mpsc::Receiver<KafkaJsonPublisherActorCommand>,
        config: KafkaConfig,
        msg_recv: async_channel::Receiver<SensorAggregate>,
        stats: KafkaJsonPublisherStats,
        shard_id: usize,
    ) -> Result<Self, KafkaJsonPublisherActorError> {
        let otel_tags: Box<[opentelemetry::KeyValue]> = Box::new([
            opentelemetry::KeyValue::new("topic", config.topic.clone()),
            opentelemetry::KeyValue::new("shard_id", opentelemetry::Value::I64(shard_id as i64)),
        ]);
        let context = LoggingProducerContext {
            telemetry_attributes: otel_tags.clone(),
            delivered_messages: stats.delivered.clone(),
            failed_delivery_messages: stats.failed_delivery.clone(),
        };
        let producer = Self::get_producer(&config, context)?;
        info!(
            "Starting Kafka JSON publisher of shard {shard_id} to topic: `{}`",
            config.topic
        );
        Ok(Self {
            cmd_rx,
            config,
            producer,
            msg_recv,
            stats,
            otel_tags,
        })
    }

    async fn send(&mut self, aggregate: &SensorAggregate) -> Result<(), KafkaJsonPublisherActorError> {
        let encoded = match encode_aggregate(aggregate) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("Error encoding aggregate to JSON: {err}");
                self.stats.error_encode.add(1, &self.otel_tags);
                return Err(err);
            }
        };
        let mut record: BaseRecord<'_, str, [u8]> = BaseRecord::to(self.config.topic.as_str())
            .key(aggregate.sensor_id.as_str())
            .payload(encoded.as_slice());
        let mut polling_interval = Duration::from_micros(10);
        loop {
            match self.producer.send(record) {
                Ok(_) => {
                    self.stats.sent.add(1, &self.otel_tags);
                    return Ok(());
                }
                Err((err, rec)) => match err {
                    KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
                        // Exponential backoff when the librdkafka is full
                        if polling_interval > MAX_POLLING_INTERVAL {
                            error!("Kafka polling interval exceeded, dropping aggregate");
                            self.stats.error_send.add(1, &self.otel_tags);
                            return Err(KafkaJsonPublisherActorError::KafkaError(err));
                        }
                        debug!("Kafka message queue is full, sleeping for {polling_interval:?}");
                        self.stats.send_retries.add(1, &self.otel_tags);
                        tokio::time::sleep(polling_interval).await;
                        polling_interval *= 2;
                        record = rec;
                        continue;
                    }
                    err => {
                        error!("Error sending aggregate: {err}");
                        self.stats.error_send.add(1, &self.otel_tags);
                        return Err(KafkaJsonPublisherActorError::KafkaError(err));
                    }
                },
            }
        }
    }

    fn flush(&self) {
        if let Err(err) = self.producer.flush(FLUSH_TIMEOUT) {
            error!("Failed to flush aggregates before shutting down: {err}");
        }
    }

    async fn run(mut self) -> anyhow::Result<String> {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(KafkaJsonPublisherActorCommand::Shutdown) => {
                            info!("Received shutdown signal");
                            self.flush();
                            return Ok("Shutting down".to_string());
                        }
                        None => {
                            warn!("KafkaJsonPublisher command channel closed, publishing until upstream closes");
                            while let Ok(aggregate) = self.msg_recv.recv().await {
                                self.stats.received.add(1, &self.otel_tags);
                                if let Err(err) = self.send(&aggregate).await {
                                    error!("Error sending aggregate to Kafka: {err}");
                                }
                            }
                            self.flush();
                            return Ok("KafkaJsonPublisher finished, upstream closed".to_string());
                        }
                    }
                }
                msg = self.msg_recv.recv() => {
                    match msg {
                        Ok(aggregate) => {
                            self.stats.received.add(1, &self.otel_tags);
                            if let Err(err) = self.send(&aggregate).await {
                                error!("Error sending aggregate to Kafka: {err}");
                            }
                        }
                        Err(_) => {
                            info!("Upstream closed, flushing Kafka producer");
                            self.flush();
                            return Ok("KafkaJsonPublisher finished, upstream closed".to_string());
                        }
                    }
                }
            }
        }
    }
}

// --- actor handle ---

#[derive(Debug)]
pub enum KafkaJsonPublisherActorHandleError {
    SendError,
}

impl std::fmt::Display for KafkaJsonPublisherActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to the Kafka JSON publisher"),
        }
    }
}

impl std::error::Error for KafkaJsonPublisherActorHandleError {}

#[derive(Debug)]
pub struct KafkaJsonPublisherActorHandle {
    cmd_tx: mpsc::Sender<KafkaJsonPublisherActorCommand>,
}

impl KafkaJsonPublisherActorHandle {
    pub fn from_config(
        config: KafkaConfig,
        msg_recv: async_channel::Receiver<SensorAggregate>,
        stats: either::Either<opentelemetry::metrics::Meter, KafkaJsonPublisherStats>,
        shard_id: usize,
    ) -> Result<(JoinHandle<anyhow::Result<String>>, Self), KafkaJsonPublisherActorError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let stats = match stats {
            either::Either::Left(meter) => KafkaJsonPublisherStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = KafkaJsonPublisherActor::from_config(cmd_rx, config, msg_recv, stats, shard_id)?;
        let join_handle = tokio::spawn(actor.run());
        let handle = Self { cmd_tx };
        Ok((join_handle, handle))
    }

    pub async fn shutdown(&self) -> Result<(), KafkaJsonPublisherActorHandleError> {
        self.cmd_tx
            .send(KafkaJsonPublisherActorCommand::Shutdown)
            .await
            .map_err(|_| KafkaJsonPublisherActorHandleError::SendError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sensoragg_reading::Metadata;

    #[test]
    fn test_kafka_config_from_yaml() {
        let yaml = r#"
topic: plant.aggregates
producer_config:
  bootstrap.servers: localhost:9092
  linger.ms: "5"
"#;
        let config: KafkaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.topic, "plant.aggregates");
        assert_eq!(
            config.producer_config.get("linger.ms").map(String::as_str),
            Some("5")
        );
    }

    #[test]
    fn test_encode_aggregate() {
        let aggregate = SensorAggregate {
            sensor_id: "s1".to_string(),
            sensor_type: Some("environment".to_string()),
            location: None,
            window_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap(),
            count: 2,
            avg_temperature: 25.0,
            min_temperature: 20.0,
            max_temperature: 30.0,
            avg_humidity: 0.0,
            min_humidity: 0.0,
            max_humidity: 0.0,
            avg_pressure: 0.0,
            min_pressure: 0.0,
            max_pressure: 0.0,
            avg_battery_level: 0.0,
            min_battery_level: 0.0,
            max_battery_level: 0.0,
            latest_status: Some("OK".to_string()),
            latest_event_time: None,
            metadata: Metadata::default(),
        };
        let encoded = encode_aggregate(&aggregate).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["sensor_id"], "s1");
        assert_eq!(value["window_start"], "2025-01-01T00:00:00Z");
        assert_eq!(value["count"], 2);
        assert_eq!(value["avg_temperature"], 25.0);
        assert_eq!(value["latest_status"], "OK");
    }

    #[tokio::test]
    async fn test_publisher_finishes_when_upstream_closes() {
        let mut producer_config = HashMap::new();
        producer_config.insert("bootstrap.servers".to_string(), "localhost:1".to_string());
        let config = KafkaConfig {
            topic: "plant.aggregates".to_string(),
            producer_config,
        };
        let (tx, rx) = async_channel::bounded::<SensorAggregate>(1);
        let (join_handle, _handle) = KafkaJsonPublisherActorHandle::from_config(
            config,
            rx,
            either::Left(opentelemetry::global::meter("sensoragg-test")),
            0,
        )
        .unwrap();
        drop(tx);
        let result = join_handle.await.unwrap();
        assert_eq!(
            result.unwrap(),
            "KafkaJsonPublisher finished, upstream closed"
        );
    }
}
