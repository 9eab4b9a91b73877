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

//! Kafka source actor feeding sensor readings into the aggregation shards.
//!
//! - `KafkaSourceActor` - consumes positional reading records from every
//!   partition of the source topic, decodes them and routes each reading to
//!   the shard owning its sensor id
//! - `KafkaSourceActorHandle` - Handle for controlling the actor
//! - `KafkaSourceStats` - Metrics collection for the source
//!
//! ## Record Processing Flow
//!
//! For each poll:
//! 1. Wait at most `poll_timeout` for the next record; a timeout counts as an
//!    empty poll and, once `empty_poll_limit` consecutive empty polls are
//!    observed, the source stops
//! 2. Decode the JSON payload into a [`SensorReading`]; decode failures either
//!    stop the source or are skipped according to [`DecodeErrorPolicy`]
//! 3. Route the reading to its shard, waiting when that shard is busy
//!
//! Receive failures are retried with exponential backoff up to
//! `max_retries` consecutive attempts.
//!
//! When the actor terminates, for any reason, it drops its [`ShardRouter`],
//! closing the shard inputs. The shards then flush their open windows.
use crate::{
    aggregation::DecodeErrorPolicy,
    inputs::kafka::SourceConfig,
    partition::{RouteError, ShardRouter},
};
use rdkafka::{
    config::ClientConfig,
    consumer::{
        stream_consumer::StreamConsumer, BaseConsumer, Consumer, ConsumerContext, Rebalance,
    },
    error::{KafkaError, KafkaResult, RDKafkaErrorCode},
    message::BorrowedMessage,
    ClientContext, Message, TopicPartitionList,
};
use sensoragg_reading::{decode_json_record, DecodeError, SensorReading};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::error::Elapsed};
use tracing::{debug, error, info, trace, warn};

const INITIAL_BACKOFF_TIME: Duration = Duration::from_millis(100);
const MAX_BACKOFF_TIME: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum KafkaSourceActorError {
    Kafka(KafkaError),
    NoPartitions(String),
    RetriesExhausted { retries: u32, last: KafkaError },
    Decode {
        partition: i32,
        offset: i64,
        err: DecodeError,
    },
    Route(RouteError),
}

impl std::fmt::Display for KafkaSourceActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kafka(err) => write!(f, "Kafka error: {err}"),
            Self::NoPartitions(topic) => write!(f, "topic `{topic}` has no partitions"),
            Self::RetriesExhausted { retries, last } => {
                write!(f, "giving up after {retries} failed receive attempts: {last}")
            }
            Self::Decode {
                partition,
                offset,
                err,
            } => write!(
                f,
                "failed to decode record at partition {partition} offset {offset}: {err}"
            ),
            Self::Route(err) => write!(f, "routing error: {err}"),
        }
    }
}

impl std::error::Error for KafkaSourceActorError {}

impl From<KafkaError> for KafkaSourceActorError {
    fn from(err: KafkaError) -> Self {
        Self::Kafka(err)
    }
}

#[derive(Debug, Clone)]
pub struct KafkaSourceStats {
    received: opentelemetry::metrics::Counter<u64>,
    empty_payload: opentelemetry::metrics::Counter<u64>,
    decode_error: opentelemetry::metrics::Counter<u64>,
    routed: opentelemetry::metrics::Counter<u64>,
    empty_polls: opentelemetry::metrics::Counter<u64>,
    receive_retries: opentelemetry::metrics::Counter<u64>,
}

impl KafkaSourceStats {
    pub fn new(meter: opentelemetry::metrics::Meter) -> Self {
        let received = meter
            .u64_counter("sensoragg.collector.input.kafka.received")
            .with_description("Number of records received from the source topic")
            .build();
        let empty_payload = meter
            .u64_counter("sensoragg.collector.input.kafka.empty_payload")
            .with_description("Number of records received with empty payload")
            .build();
        let decode_error = meter
            .u64_counter("sensoragg.collector.input.kafka.decode_error")
            .with_description("Number of records that could not be decoded into a reading")
            .build();
        let routed = meter
            .u64_counter("sensoragg.collector.input.kafka.routed")
            .with_description("Number of readings handed to an aggregation shard")
            .build();
        let empty_polls = meter
            .u64_counter("sensoragg.collector.input.kafka.empty_polls")
            .with_description("Number of polls that returned no record within the poll timeout")
            .build();
        let receive_retries = meter
            .u64_counter("sensoragg.collector.input.kafka.receive_retries")
            .with_description("Number of retried receive attempts after a Kafka error")
            .build();
        Self {
            received,
            empty_payload,
            decode_error,
            routed,
            empty_polls,
            receive_retries,
        }
    }
}

#[derive(Debug)]
enum KafkaSourceActorCommand {
    Shutdown,
}

/// Consumer context logging rebalance and commit callbacks
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        info!("Committing offsets: {:?}", result);
    }
}

/// Outcome of handling the payload of one record
#[derive(Debug)]
enum RecordOutcome {
    Reading(SensorReading),
    EmptyPayload,
    Skipped(DecodeError),
    Rejected(DecodeError),
}

impl RecordOutcome {
    fn from_payload(payload: Option<&[u8]>, policy: DecodeErrorPolicy) -> Self {
        let Some(payload) = payload else {
            return Self::EmptyPayload;
        };
        match decode_json_record(payload) {
            Ok(reading) => Self::Reading(reading),
            Err(err) => match policy {
                DecodeErrorPolicy::Abort => Self::Rejected(err),
                DecodeErrorPolicy::Skip => Self::Skipped(err),
            },
        }
    }
}

/// Result of a single bounded poll, detached from the consumer's buffers
#[derive(Debug)]
enum Polled {
    Empty,
    Failed(KafkaError),
    Record {
        partition: i32,
        offset: i64,
        outcome: RecordOutcome,
    },
}

impl Polled {
    fn new(
        polled: Result<KafkaResult<BorrowedMessage<'_>>, Elapsed>,
        policy: DecodeErrorPolicy,
    ) -> Self {
        match polled {
            Err(_) => Self::Empty,
            Ok(Err(err)) => Self::Failed(err),
            Ok(Ok(msg)) => Self::Record {
                partition: msg.partition(),
                offset: msg.offset(),
                outcome: RecordOutcome::from_payload(msg.payload(), policy),
            },
        }
    }
}

struct KafkaSourceActor {
    cmd_rx: mpsc::Receiver<KafkaSourceActorCommand>,
    config: SourceConfig,
    topic: String,
    decode_error_policy: DecodeErrorPolicy,
    consumer: StreamConsumer<KafkaContext>,
    router: ShardRouter,
    stats: KafkaSourceStats,
    otel_tags: Vec<opentelemetry::KeyValue>,
}

impl KafkaSourceActor {
    fn new(
        config: SourceConfig,
        decode_error_policy: DecodeErrorPolicy,
        cmd_rx: mpsc::Receiver<KafkaSourceActorCommand>,
        router: ShardRouter,
        stats: KafkaSourceStats,
    ) -> Result<Self, KafkaSourceActorError> {
        let consumer = Self::init_consumer(&config)?;
        let topic = config.topic();
        let otel_tags = vec![opentelemetry::KeyValue::new("topic", topic.clone())];
        Ok(Self {
            cmd_rx,
            config,
            topic,
            decode_error_policy,
            consumer,
            router,
            stats,
            otel_tags,
        })
    }

    fn client_config(config: &SourceConfig) -> ClientConfig {
        let mut client_conf = ClientConfig::new();
        client_conf
            .set("bootstrap.servers", config.bootstrap.as_str())
            .set("group.id", config.group_id.as_str())
            .set("enable.auto.commit", "false");
        for (k, v) in &config.consumer_config {
            client_conf.set(k.as_str(), v.as_str());
        }
        client_conf
    }

    /// Creates the consumer and assigns it every partition of the topic at
    /// the configured start offset
    fn init_consumer(
        config: &SourceConfig,
    ) -> Result<StreamConsumer<KafkaContext>, KafkaSourceActorError> {
        let topic = config.topic();
        let consumer: StreamConsumer<KafkaContext> =
            match Self::client_config(config).create_with_context(KafkaContext) {
                Ok(consumer) => consumer,
                Err(err) => {
                    error!("Failed to create consumer: {err}");
                    return Err(KafkaSourceActorError::Kafka(err));
                }
            };

        debug!("Fetching metadata of topic `{topic}` from {}", config.bootstrap);
        let metadata = match consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT) {
            Ok(metadata) => metadata,
            Err(err) => {
                error!("Failed to connect to Kafka brokers or fetch topic metadata: {err}");
                return Err(KafkaSourceActorError::Kafka(err));
            }
        };
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();
        if partitions.is_empty() {
            error!("Topic `{topic}` has no partitions to subscribe to");
            return Err(KafkaSourceActorError::NoPartitions(topic));
        }

        let offset = rdkafka::Offset::from(config.start_offset);
        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            assignment.add_partition_offset(&topic, *partition, offset)?;
        }
        if let Err(err) = consumer.assign(&assignment) {
            error!("Failed to assign partitions of topic `{topic}`: {err}");
            return Err(KafkaSourceActorError::Kafka(err));
        }
        info!(
            "Subscribed to {} partitions of topic `{topic}` from {:?}",
            partitions.len(),
            config.start_offset
        );
        Ok(consumer)
    }

    async fn run(mut self) -> anyhow::Result<String> {
        info!(
            "Starting Kafka source actor for topic `{}` feeding {} shards",
            self.topic,
            self.router.shards()
        );
        let mut empty_polls: u32 = 0;
        let mut total_records: u64 = 0;
        let mut retries: u32 = 0;
        let mut backoff_time = INITIAL_BACKOFF_TIME;
        loop {
            let polled = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    return match cmd {
                        Some(KafkaSourceActorCommand::Shutdown) => {
                            info!("Kafka source actor shutting down after {total_records} records");
                            Ok("Kafka source actor terminated after a shutdown command".to_string())
                        }
                        None => {
                            info!("Kafka source actor terminated due to empty command channel");
                            Ok("Kafka source actor terminated due to empty command channel".to_string())
                        }
                    }
                }
                polled = tokio::time::timeout(self.config.poll_timeout, self.consumer.recv()) => {
                    Polled::new(polled, self.decode_error_policy)
                }
            };

            match polled {
                Polled::Empty => {
                    empty_polls += 1;
                    self.stats.empty_polls.add(1, &self.otel_tags);
                    trace!("Empty poll {empty_polls} on topic `{}`", self.topic);
                    if let Some(limit) = self.config.empty_poll_limit {
                        if empty_polls >= limit {
                            if total_records == 0 {
                                info!(
                                    "No records observed within the polling budget of {limit} empty polls on topic `{}`",
                                    self.topic
                                );
                            } else {
                                info!(
                                    "Stopping after {limit} consecutive empty polls, {total_records} records consumed from topic `{}`",
                                    self.topic
                                );
                            }
                            return Ok(format!(
                                "Kafka source actor finished after {total_records} records"
                            ));
                        }
                    }
                }
                Polled::Failed(err) => {
                    if let KafkaError::MessageConsumption(
                        RDKafkaErrorCode::UnknownTopicOrPartition,
                    ) = err
                    {
                        error!("Kafka topic doesn't exist, shutting down: {err}");
                        return Err(KafkaSourceActorError::Kafka(err).into());
                    }
                    retries += 1;
                    if retries > self.config.max_retries {
                        error!("Failed to receive Kafka record after {retries} attempts, shutting down: {err}");
                        return Err(KafkaSourceActorError::RetriesExhausted {
                            retries,
                            last: err,
                        }
                        .into());
                    }
                    warn!(
                        "Failed to receive Kafka record (attempt {retries}/{}), retrying in {backoff_time:?}: {err}",
                        self.config.max_retries
                    );
                    self.stats.receive_retries.add(1, &self.otel_tags);
                    tokio::time::sleep(backoff_time).await;
                    backoff_time = (backoff_time * 2).min(MAX_BACKOFF_TIME);
                }
                Polled::Record {
                    partition,
                    offset,
                    outcome,
                } => {
                    retries = 0;
                    backoff_time = INITIAL_BACKOFF_TIME;
                    empty_polls = 0;
                    total_records += 1;
                    self.stats.received.add(1, &self.otel_tags);
                    match outcome {
                        RecordOutcome::Reading(reading) => {
                            let shard_id = self
                                .router
                                .route(reading)
                                .await
                                .map_err(KafkaSourceActorError::Route)?;
                            self.stats.routed.add(1, &self.otel_tags);
                            trace!("Routed record at partition {partition} offset {offset} to shard {shard_id}");
                        }
                        RecordOutcome::EmptyPayload => {
                            self.stats.empty_payload.add(1, &self.otel_tags);
                            warn!(
                                "Empty payload at topic `{}` partition {partition} and offset {offset}",
                                self.topic
                            );
                        }
                        RecordOutcome::Skipped(err) => {
                            self.stats.decode_error.add(1, &self.otel_tags);
                            warn!(
                                "Skipping undecodable record at topic `{}` partition {partition} offset {offset}: {err}",
                                self.topic
                            );
                        }
                        RecordOutcome::Rejected(err) => {
                            self.stats.decode_error.add(1, &self.otel_tags);
                            error!(
                                "Undecodable record at topic `{}` partition {partition} offset {offset}, shutting down: {err}",
                                self.topic
                            );
                            return Err(KafkaSourceActorError::Decode {
                                partition,
                                offset,
                                err,
                            }
                            .into());
                        }
                    }
                    if let Some(limit) = self.config.record_limit {
                        if total_records >= limit {
                            info!("Record limit of {limit} reached on topic `{}`", self.topic);
                            return Ok(format!(
                                "Kafka source actor finished after {total_records} records"
                            ));
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum KafkaSourceActorHandleError {
    SendError,
}

impl std::fmt::Display for KafkaSourceActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to the Kafka source actor"),
        }
    }
}

impl std::error::Error for KafkaSourceActorHandleError {}

/// Handle for controlling a Kafka source actor.
#[derive(Debug)]
pub struct KafkaSourceActorHandle {
    cmd_send: mpsc::Sender<KafkaSourceActorCommand>,
}

impl KafkaSourceActorHandle {
    /// Connects to the source and spawns the actor.
    ///
    /// Failing to create the consumer, fetch the topic metadata or assign its
    /// partitions is reported here and nothing is spawned.
    pub fn new(
        config: SourceConfig,
        decode_error_policy: DecodeErrorPolicy,
        router: ShardRouter,
        stats: either::Either<opentelemetry::metrics::Meter, KafkaSourceStats>,
    ) -> Result<(JoinHandle<anyhow::Result<String>>, Self), KafkaSourceActorError> {
        let (cmd_send, cmd_rx) = mpsc::channel::<KafkaSourceActorCommand>(1);
        let stats = match stats {
            either::Left(meter) => KafkaSourceStats::new(meter),
            either::Right(stats) => stats,
        };
        let actor = KafkaSourceActor::new(config, decode_error_policy, cmd_rx, router, stats)?;
        let join_handle = tokio::spawn(actor.run());
        Ok((join_handle, KafkaSourceActorHandle { cmd_send }))
    }

    /// Stops consuming. Readings already routed are still aggregated and
    /// flushed by the shards.
    pub async fn shutdown(&self) -> Result<(), KafkaSourceActorHandleError> {
        self.cmd_send
            .send(KafkaSourceActorCommand::Shutdown)
            .await
            .map_err(|_| KafkaSourceActorHandleError::SendError)
    }
}
