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

//! Configuration for the windowed sensor aggregation.

use crate::config::ConfigurationError;
use sensoragg_analytics::window::TumblingWindows;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

const fn default_workers() -> usize {
    1
}

const fn default_window_size_minutes() -> u64 {
    1
}

const fn default_bounded_delay_seconds() -> u64 {
    5
}

const fn default_buffer_size() -> usize {
    1_000
}

/// What to do with a record that cannot be decoded into a reading
#[derive(Display, Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecodeErrorPolicy {
    /// Stop the pipeline with an error
    #[default]
    Abort,
    /// Log, count and continue with the next record
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    /// Number of key partitions, one aggregation actor each
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_window_size_minutes")]
    pub window_size_minutes: u64,

    /// Tolerated out-of-orderness of event times
    #[serde(default = "default_bounded_delay_seconds")]
    pub bounded_delay_seconds: u64,

    /// Capacity of each shard's reading channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub decode_error_policy: DecodeErrorPolicy,
}

impl AggregationConfig {
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_minutes.saturating_mul(60))
    }

    pub fn bounded_delay(&self) -> Duration {
        Duration::from_secs(self.bounded_delay_seconds)
    }

    pub fn windows(&self) -> Result<TumblingWindows, ConfigurationError> {
        TumblingWindows::new(self.window_size()).map_err(|_| ConfigurationError::InvalidWindowSize)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.workers == 0 {
            return Err(ConfigurationError::InvalidWorkerCount);
        }
        if self.window_size_minutes == 0 {
            return Err(ConfigurationError::InvalidWindowSize);
        }
        self.windows()?;
        if self.buffer_size == 0 {
            return Err(ConfigurationError::InvalidBufferSize);
        }
        Ok(())
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            window_size_minutes: default_window_size_minutes(),
            bounded_delay_seconds: default_bounded_delay_seconds(),
            buffer_size: default_buffer_size(),
            decode_error_policy: DecodeErrorPolicy::default(),
        }
    }
}
