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

//! Sinks for window aggregates.
//!
//! One publisher actor runs per aggregation shard and consumes that shard's
//! aggregates in emission order. A publisher terminates normally once its
//! shard closes the aggregate channel.

use crate::{aggregation::SensorAggregate, config::PublisherEndpoint};
use opentelemetry::metrics::Meter;
use rdkafka::{
    message::DeliveryResult,
    producer::{NoCustomPartitioner, ProducerContext},
    ClientContext,
};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

pub mod kafka_json;
pub mod log;

/// Producer context with tracing logs enabled
#[derive(Clone)]
pub struct LoggingProducerContext {
    pub telemetry_attributes: Box<[opentelemetry::KeyValue]>,
    pub delivered_messages: opentelemetry::metrics::Counter<u64>,
    pub failed_delivery_messages: opentelemetry::metrics::Counter<u64>,
}

impl ClientContext for LoggingProducerContext {}

impl ProducerContext<NoCustomPartitioner> for LoggingProducerContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(_) => {
                trace!("Aggregate delivered successfully to kafka");
                self.delivered_messages.add(1, &self.telemetry_attributes);
            }
            Err((err, _)) => {
                warn!("Failed to deliver aggregate to kafka: {err}");
                self.failed_delivery_messages
                    .add(1, &self.telemetry_attributes)
            }
        }
    }
}

#[derive(Debug)]
pub enum PublisherActorError {
    KafkaJson(kafka_json::KafkaJsonPublisherActorError),
}

impl std::fmt::Display for PublisherActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KafkaJson(err) => write!(f, "Kafka JSON publisher error: {err}"),
        }
    }
}

impl std::error::Error for PublisherActorError {}

/// Handle to the publisher of one shard, whichever endpoint is configured
#[derive(Debug)]
pub enum PublisherActorHandle {
    Log(log::LogPublisherActorHandle),
    KafkaJson(kafka_json::KafkaJsonPublisherActorHandle),
}

impl PublisherActorHandle {
    pub fn from_config(
        endpoint: &PublisherEndpoint,
        msg_recv: async_channel::Receiver<SensorAggregate>,
        meter: Meter,
        shard_id: usize,
    ) -> Result<(JoinHandle<anyhow::Result<String>>, Self), PublisherActorError> {
        match endpoint {
            PublisherEndpoint::Log => {
                let (join_handle, handle) = log::LogPublisherActorHandle::new(
                    msg_recv,
                    either::Left(meter),
                    shard_id,
                );
                Ok((join_handle, Self::Log(handle)))
            }
            PublisherEndpoint::KafkaJson(config) => {
                let (join_handle, handle) =
                    kafka_json::KafkaJsonPublisherActorHandle::from_config(
                        config.clone(),
                        msg_recv,
                        either::Left(meter),
                        shard_id,
                    )
                    .map_err(PublisherActorError::KafkaJson)?;
                Ok((join_handle, Self::KafkaJson(handle)))
            }
        }
    }

    /// Stops the publisher without waiting for the shard to close
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        match self {
            Self::Log(handle) => handle.shutdown().await?,
            Self::KafkaJson(handle) => handle.shutdown().await?,
        }
        Ok(())
    }
}
