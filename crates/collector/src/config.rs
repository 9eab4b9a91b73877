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

use crate::{aggregation::AggregationConfig, inputs::kafka::SourceConfig, publishers::kafka_json};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde_with::serde_as;
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    InvalidLoggingLevel(String),
    InvalidThreadCount,
    InvalidWorkerCount,
    InvalidWindowSize,
    InvalidBufferSize,
    InvalidPollTimeout,
    InvalidEmptyPollLimit,
    InvalidRecordLimit,
    MissingSourceTable,
    MissingPublisherTopic,
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLoggingLevel(level) => write!(f, "invalid logging level \"{level}\""),
            Self::InvalidThreadCount => write!(f, "runtime threads must be greater than 0"),
            Self::InvalidWorkerCount => write!(f, "workers must be greater than 0"),
            Self::InvalidWindowSize => {
                write!(f, "window_size_minutes must be a positive number of minutes")
            }
            Self::InvalidBufferSize => write!(f, "buffer_size must be greater than 0"),
            Self::InvalidPollTimeout => write!(f, "poll_timeout must be greater than 0"),
            Self::InvalidEmptyPollLimit => write!(f, "empty_poll_limit must be greater than 0"),
            Self::InvalidRecordLimit => write!(f, "record_limit must be greater than 0"),
            Self::MissingSourceTable => write!(f, "source database and table must be set"),
            Self::MissingPublisherTopic => write!(f, "kafka_json publisher topic must be set"),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Environment variables with this prefix override the configuration file,
/// nested keys are separated by `__`
pub const ENV_PREFIX: &str = "SENSORAGG_";

#[derive(Debug)]
pub enum ConfigLoadError {
    MissingFile(PathBuf),
    Parse(Box<figment::Error>),
    Invalid(ConfigurationError),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "config file {} not found", path.display()),
            Self::Parse(err) => write!(f, "parsing config file failed: {err}"),
            Self::Invalid(err) => write!(f, "invalid configuration: {err}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

pub(crate) const fn default_telemetry_timeout() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_telemetry_interval() -> Duration {
    Duration::from_secs(60)
}

pub(crate) const fn default_buffer_size() -> usize {
    1_000
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

impl CollectorConfig {
    /// Checks the whole configuration, nothing is started before this passes
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.logging.level()?;
        if let Some(threads) = self.runtime.threads {
            if threads == 0 {
                return Err(ConfigurationError::InvalidThreadCount);
            }
        }
        self.source.validate()?;
        self.aggregation.validate()?;
        self.publisher.validate()?;
        Ok(())
    }
}

impl CollectorConfig {
    /// Load the YAML file at `path` with environment overrides and validate
    /// the result. A missing file is an error rather than an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.is_file() {
            return Err(ConfigLoadError::MissingFile(path.to_path_buf()));
        }
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|err| ConfigLoadError::Parse(Box::new(err)))?;
        config.validate().map_err(ConfigLoadError::Invalid)?;
        Ok(config)
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl LoggingConfig {
    pub fn level(&self) -> Result<tracing::Level, ConfigurationError> {
        tracing::Level::from_str(&self.level)
            .map_err(|_| ConfigurationError::InvalidLoggingLevel(self.level.clone()))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    pub url: String,

    /// Metrics exporter GRPC timeout
    #[serde(default = "default_telemetry_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub exporter_timeout: Duration,

    /// Configures the intervening time between exports for a
    /// [opentelemetry_sdk::metrics::PeriodicReader]
    #[serde(default = "default_telemetry_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub reader_interval: Duration,
}

impl TelemetryConfig {
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Capacity of the channel between a shard and its publisher
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub endpoint: PublisherEndpoint,
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.buffer_size == 0 {
            return Err(ConfigurationError::InvalidBufferSize);
        }
        if let PublisherEndpoint::KafkaJson(config) = &self.endpoint {
            if config.topic.is_empty() {
                return Err(ConfigurationError::MissingPublisherTopic);
            }
        }
        Ok(())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            endpoint: PublisherEndpoint::default(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherEndpoint {
    /// Write every aggregate to the log at info level
    #[default]
    Log,
    KafkaJson(kafka_json::KafkaConfig),
}
