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

use crate::{
    aggregation::{combined_watermark, AggregationActorHandle, AggregationStats},
    config::{CollectorConfig, PublisherEndpoint},
    inputs::kafka::KafkaSourceActorHandle,
    partition::ShardRouter,
    publishers::PublisherActorHandle,
};
use futures_util::{
    future::{BoxFuture, FutureExt},
    stream::FuturesUnordered,
    StreamExt,
};
use std::{future::Future, time::Duration};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, warn};

pub mod aggregation;
pub mod config;
pub mod inputs;
pub mod partition;
pub mod publishers;
pub mod telemetry;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type ActorExit = (String, Result<anyhow::Result<String>, JoinError>);

/// Spawned actors of one pipeline, aborted when dropped
#[derive(Default)]
struct Actors {
    running: FuturesUnordered<BoxFuture<'static, ActorExit>>,
    abort_handles: Vec<AbortHandle>,
}

impl Actors {
    fn push(&mut self, name: String, join_handle: JoinHandle<anyhow::Result<String>>) {
        self.abort_handles.push(join_handle.abort_handle());
        self.running
            .push(async move { (name, join_handle.await) }.boxed());
    }

    fn abort_all(&self) {
        for handle in &self.abort_handles {
            handle.abort();
        }
    }
}

impl Drop for Actors {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn endpoint_name(endpoint: &PublisherEndpoint) -> String {
    match endpoint {
        PublisherEndpoint::Log => "log".to_string(),
        PublisherEndpoint::KafkaJson(config) => format!("kafka_json(topic={})", config.topic),
    }
}

fn log_effective_options(config: &CollectorConfig) {
    info!(
        "Starting sensor aggregation: bootstrap={}, topic={}, start_offset={:?}, window={}min, bounded_delay={}s, workers={}, decode_error_policy={}, publisher={}",
        config.source.bootstrap,
        config.source.topic(),
        config.source.start_offset,
        config.aggregation.window_size_minutes,
        config.aggregation.bounded_delay_seconds,
        config.aggregation.workers(),
        config.aggregation.decode_error_policy,
        endpoint_name(&config.publisher.endpoint),
    );
}

/// Runs the aggregation pipeline until the source finishes and every shard
/// has drained.
pub async fn run_pipeline(
    config: CollectorConfig,
    meter: opentelemetry::metrics::Meter,
) -> anyhow::Result<()> {
    run_pipeline_until(config, meter, std::future::pending::<()>()).await
}

/// Runs the aggregation pipeline, stopping the source gracefully once
/// `shutdown` completes.
///
/// Shards flush their open windows and publishers forward every aggregate
/// before this returns. When any actor fails, the remaining ones are stopped
/// without flushing and the failure is returned.
pub async fn run_pipeline_until<F>(
    config: CollectorConfig,
    meter: opentelemetry::metrics::Meter,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    log_effective_options(&config);

    let mut actors = Actors::default();
    let (router, readings_receivers) =
        ShardRouter::with_shards(config.aggregation.workers(), config.aggregation.buffer_size);
    let aggregation_stats = AggregationStats::new(meter.clone());
    let mut agg_handles = Vec::with_capacity(readings_receivers.len());
    let mut publisher_handles = Vec::with_capacity(readings_receivers.len());
    for (shard_id, readings_rx) in readings_receivers.into_iter().enumerate() {
        let (agg_join, agg_handle) = AggregationActorHandle::new(
            config.publisher.buffer_size,
            config.aggregation.clone(),
            readings_rx,
            either::Right(aggregation_stats.clone()),
            shard_id,
        )?;
        let (publisher_join, publisher_handle) = PublisherActorHandle::from_config(
            &config.publisher.endpoint,
            agg_handle.subscribe(),
            meter.clone(),
            shard_id,
        )?;
        actors.push(format!("aggregation shard {shard_id}"), agg_join);
        actors.push(format!("publisher of shard {shard_id}"), publisher_join);
        agg_handles.push(agg_handle);
        publisher_handles.push(publisher_handle);
    }

    let watermark_handles = agg_handles.clone();
    let _watermark_gauge = meter
        .i64_observable_gauge("sensoragg.collector.aggregation.watermark")
        .with_description("Combined event time watermark of all shards in milliseconds since epoch")
        .with_callback(move |observer| {
            if let Some(watermark) = combined_watermark(&watermark_handles) {
                observer.observe(watermark.timestamp_millis(), &[]);
            }
        })
        .build();

    // Owns the router: the shards drain once the source terminates
    let (source_join, source_handle) = KafkaSourceActorHandle::new(
        config.source.clone(),
        config.aggregation.decode_error_policy,
        router,
        either::Left(meter.clone()),
    )?;
    actors.push("kafka source".to_string(), source_join);

    pin_utils::pin_mut!(shutdown);
    let mut shutdown_requested = false;
    loop {
        tokio::select! {
            _ = &mut shutdown, if !shutdown_requested => {
                info!("Shutdown requested, stopping the source and draining the shards");
                shutdown_requested = true;
                if let Err(err) = source_handle.shutdown().await {
                    // The source already terminated on its own
                    warn!("Kafka source did not accept the shutdown command: {err}");
                }
            }
            next = actors.running.next() => {
                match next {
                    None => {
                        info!(
                            "All actors terminated, last combined watermark: {:?}",
                            combined_watermark(&agg_handles)
                        );
                        return Ok(());
                    }
                    Some((name, Ok(Ok(msg)))) => {
                        info!("{name} terminated: {msg}");
                    }
                    Some((name, Ok(Err(err)))) => {
                        error!("{name} failed, stopping the pipeline: {err}");
                        stop_publishers(&publisher_handles).await;
                        actors.abort_all();
                        return Err(err.context(format!("{name} failed")));
                    }
                    Some((name, Err(err))) => {
                        error!("{name} panicked or was cancelled, stopping the pipeline: {err}");
                        stop_publishers(&publisher_handles).await;
                        actors.abort_all();
                        return Err(anyhow::anyhow!("{name} did not complete: {err}"));
                    }
                }
            }
        }
    }
}

async fn stop_publishers(handles: &[PublisherActorHandle]) {
    for (shard_id, handle) in handles.iter().enumerate() {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("Error in shutting down publisher of shard {shard_id}: {err}")
            }
            Err(_) => warn!("Timeout shutting down publisher of shard {shard_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationError;

    #[tokio::test]
    async fn test_invalid_configuration_starts_nothing() {
        let mut config = CollectorConfig::default();
        config.aggregation.workers = 0;
        let result = run_pipeline(config, opentelemetry::global::meter("sensoragg-test")).await;
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigurationError>(),
            Some(&ConfigurationError::InvalidWorkerCount)
        );
    }

    #[tokio::test]
    async fn test_source_startup_failure_is_fatal() {
        let mut config = CollectorConfig::default();
        config.aggregation.workers = 2;
        config
            .source
            .consumer_config
            .insert("no.such.property".to_string(), "1".to_string());
        let result = run_pipeline(config, opentelemetry::global::meter("sensoragg-test")).await;
        assert!(result
            .unwrap_err()
            .downcast_ref::<inputs::kafka::KafkaSourceActorError>()
            .is_some());
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(endpoint_name(&PublisherEndpoint::Log), "log");
        let endpoint = PublisherEndpoint::KafkaJson(publishers::kafka_json::KafkaConfig {
            topic: "plant.aggregates".to_string(),
            ..Default::default()
        });
        assert_eq!(endpoint_name(&endpoint), "kafka_json(topic=plant.aggregates)");
    }
}
