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

//! OTLP metrics export.

use crate::config::TelemetryConfig;
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::info;

pub const SERVICE_NAME: &str = "sensoragg-collector";

#[derive(Debug)]
pub enum TelemetryError {
    Exporter(ExporterBuildError),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exporter(err) => write!(f, "failed to build OTLP metrics exporter: {err}"),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<ExporterBuildError> for TelemetryError {
    fn from(err: ExporterBuildError) -> Self {
        Self::Exporter(err)
    }
}

/// Builds an OTLP/gRPC meter provider and installs it as the global one.
///
/// The caller keeps the returned provider and shuts it down on exit so the
/// last metrics are exported.
pub fn init_meter_provider(config: &TelemetryConfig) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.url())
        .with_timeout(config.exporter_timeout)
        .build()?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.reader_interval)
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());
    info!("Exporting metrics to {} every {:?}", config.url(), config.reader_interval);
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let config = TelemetryConfig {
            url: "not a valid uri".to_string(),
            exporter_timeout: Duration::from_secs(1),
            reader_interval: Duration::from_secs(1),
        };
        assert!(matches!(
            init_meter_provider(&config),
            Err(TelemetryError::Exporter(_))
        ));
    }
}
