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

use sensoragg_collector::{config::CollectorConfig, run_pipeline_until, telemetry};
use std::{env, path::PathBuf};
use tracing::{info, warn, Level};

fn init_tracing(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| format!("setting default subscriber failed: {err}"))?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        return Err(format!("Usage: {} <config-file>", args[0]).into());
    }
    let config_file = PathBuf::from(&args[1]);
    let config = CollectorConfig::load(&config_file)?;
    init_tracing(config.logging.level()?)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // If num threads is not configured then the default use all CPU cores is used
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    runtime.block_on(async move {
        let meter_provider = match &config.telemetry {
            Some(telemetry_config) => Some(telemetry::init_meter_provider(telemetry_config)?),
            None => None,
        };
        let meter = opentelemetry::global::meter("sensoragg");

        let termination = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Termination signal received, gracefully shutting down actors"),
                Err(err) => {
                    warn!("Unable to listen for the termination signal: {err}");
                    std::future::pending::<()>().await
                }
            }
        };
        let result = run_pipeline_until(config, meter, termination).await;

        if let Some(provider) = meter_provider {
            if let Err(err) = provider.shutdown() {
                warn!("Failed to shut down the meter provider: {err}");
            }
        }
        result?;
        info!("Sensor aggregation terminated");
        Ok::<(), Box<dyn std::error::Error + Send + Sync + 'static>>(())
    })
}
