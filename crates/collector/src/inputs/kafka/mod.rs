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

use crate::config::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{collections::HashMap, time::Duration};

mod actor;

pub use actor::{
    KafkaSourceActorError, KafkaSourceActorHandle, KafkaSourceActorHandleError, KafkaSourceStats,
};

fn default_bootstrap() -> String {
    "localhost:9124".to_string()
}

fn default_database() -> String {
    "iot".to_string()
}

fn default_table() -> String {
    "sensor_readings".to_string()
}

fn default_group_id() -> String {
    "sensoragg".to_string()
}

const fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_retries() -> u32 {
    5
}

/// Where to start reading every partition of the source topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
    /// Absolute offset, applied to all partitions
    Offset(i64),
}

impl From<StartOffset> for rdkafka::Offset {
    fn from(value: StartOffset) -> Self {
        match value {
            StartOffset::Earliest => rdkafka::Offset::Beginning,
            StartOffset::Latest => rdkafka::Offset::End,
            StartOffset::Offset(offset) => rdkafka::Offset::Offset(offset),
        }
    }
}

/// Reading source: a table of the log service exposed as topic
/// `<database>.<table>`
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default)]
    pub start_offset: StartOffset,

    /// Upper bound of a single poll
    #[serde(default = "default_poll_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_timeout: Duration,

    /// Stop after this many consecutive empty polls, wait forever when unset
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub empty_poll_limit: Option<u32>,

    /// Stop after this many records
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub record_limit: Option<u64>,

    /// Consecutive failed receives tolerated before the source gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Additional librdkafka consumer properties
    #[serde(default)]
    pub consumer_config: HashMap<String, String>,
}

impl SourceConfig {
    pub fn topic(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.is_empty() || self.table.is_empty() {
            return Err(ConfigurationError::MissingSourceTable);
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigurationError::InvalidPollTimeout);
        }
        if self.empty_poll_limit == Some(0) {
            return Err(ConfigurationError::InvalidEmptyPollLimit);
        }
        if self.record_limit == Some(0) {
            return Err(ConfigurationError::InvalidRecordLimit);
        }
        Ok(())
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bootstrap: default_bootstrap(),
            database: default_database(),
            table: default_table(),
            group_id: default_group_id(),
            start_offset: StartOffset::default(),
            poll_timeout: default_poll_timeout(),
            empty_poll_limit: None,
            record_limit: None,
            max_retries: default_max_retries(),
            consumer_config: HashMap::new(),
        }
    }
}
