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

//! Routing of readings to key partitions.
//!
//! All readings of one sensor id land in the same shard, so a shard owns
//! every accumulator of the sensors routed to it.

use sensoragg_reading::SensorReading;
use std::hash::{Hash, Hasher};

/// Shard index for `key` among `shards` partitions
pub fn shard_for(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = std::hash::DefaultHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

#[derive(Debug)]
pub enum RouteError {
    ShardClosed(usize),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShardClosed(shard_id) => {
                write!(f, "shard {shard_id} stopped accepting readings")
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Sending half of all shard channels.
///
/// Dropping the router closes every shard's input, which makes the shards
/// flush their open windows and terminate.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    senders: Vec<async_channel::Sender<SensorReading>>,
}

impl ShardRouter {
    pub fn new(senders: Vec<async_channel::Sender<SensorReading>>) -> Self {
        Self { senders }
    }

    /// Creates `shards` bounded channels and returns the router together
    /// with the receiving halves, indexed by shard id
    pub fn with_shards(
        shards: usize,
        buffer_size: usize,
    ) -> (Self, Vec<async_channel::Receiver<SensorReading>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| async_channel::bounded(buffer_size.max(1)))
            .unzip();
        (Self::new(senders), receivers)
    }

    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    /// Sends the reading to its shard, waiting while that shard's buffer is
    /// full
    pub async fn route(&self, reading: SensorReading) -> Result<usize, RouteError> {
        let shard_id = shard_for(reading.key(), self.senders.len());
        self.senders[shard_id]
            .send(reading)
            .await
            .map_err(|_| RouteError::ShardClosed(shard_id))?;
        Ok(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sensoragg_reading::Metadata;

    fn reading(sensor_id: Option<&str>) -> SensorReading {
        SensorReading::new(
            sensor_id.map(str::to_string),
            None,
            None,
            20.0,
            40.0,
            1000.0,
            80.0,
            None,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Metadata::default(),
        )
    }

    #[test]
    fn test_shard_for_is_stable_and_in_range() {
        for key in ["s1", "s2", "boiler-7", ""] {
            let shard = shard_for(key, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(key, 4));
        }
        assert_eq!(shard_for("s1", 1), 0);
        assert_eq!(shard_for("s1", 0), 0);
    }

    #[tokio::test]
    async fn test_same_sensor_routes_to_same_shard() {
        let (router, receivers) = ShardRouter::with_shards(3, 10);
        assert_eq!(router.shards(), 3);
        let first = router.route(reading(Some("s1"))).await.unwrap();
        let second = router.route(reading(Some("s1"))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(receivers[first].len(), 2);

        // Readings without an id share the empty key
        let anonymous = router.route(reading(None)).await.unwrap();
        assert_eq!(anonymous, shard_for("", 3));
    }

    #[tokio::test]
    async fn test_dropping_router_closes_shards() {
        let (router, receivers) = ShardRouter::with_shards(2, 10);
        router.route(reading(Some("s1"))).await.unwrap();
        drop(router);
        let total: usize = receivers.iter().map(|rx| rx.len()).sum();
        assert_eq!(total, 1);
        for rx in &receivers {
            while rx.recv().await.is_ok() {}
            assert!(rx.is_closed());
        }
    }

    #[tokio::test]
    async fn test_route_to_closed_shard_fails() {
        let (router, receivers) = ShardRouter::with_shards(1, 10);
        receivers[0].close();
        assert!(matches!(
            router.route(reading(Some("s1"))).await,
            Err(RouteError::ShardClosed(0))
        ));
    }
}
