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

//! A module that provides keyed, event-time tumbling window aggregation.
//!
//! The main components are:
//! - `TimeSeriesData`: A trait that defines required methods for time-series
//!   data points
//! - `Aggregator`: A trait defining how data is folded into and merged between
//!   per-window accumulators
//! - `WindowAggregator`: Core struct that owns the accumulator store, the
//!   watermark and the trigger logic
//! - `WindowedAggregationAdaptor` and `WindowedAggregationStreamAdaptor`:
//!   Iterator and Stream adapters providing an ergonomic API over
//!   `WindowAggregator`
//!
//! The windowing system features:
//! - Fixed-sized, epoch-aligned windows `[start, start + size)`
//! - A partition-wide watermark `max(event time) - bounded_delay` that decides
//!   when a window fires; a window fires exactly once, the first time the
//!   watermark reaches its end
//! - Out-of-order events are folded as long as their window is still open,
//!   events for already fired windows are handed back as late
//! - Deterministic emission order: increasing window start, then key order
//!
//! Example usage:
//! ```text
//! use std::time::Duration;
//! use sensoragg_analytics::{aggregation::*, window::TumblingWindows};
//!
//! let windows = TumblingWindows::new(Duration::from_secs(60))?;
//! let aggregator = WindowAggregator::<String, (), MyAggregator>::new(
//!     windows,
//!     Duration::from_secs(5), // bounded out-of-orderness
//!     (),
//! );
//! let results = get_time_series_data_iterator()
//!     .window_aggregate(aggregator)
//!     .filter_map(|x| x.left()) // Keep only emitted aggregates
//!     .collect::<Vec<_>>();
//! ```

use crate::{
    watermark::BoundedOutOfOrderness,
    window::{TumblingWindows, Window},
};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use pin_project::pin_project;
use std::{
    collections::{BTreeMap, VecDeque},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

/// A trait for defining time-series data points
pub trait TimeSeriesData<K> {
    fn get_key(&self) -> K;
    fn get_ts(&self) -> DateTime<Utc>;
}

/// A trait for defining aggregation logic.
///
/// Accumulators are moved through every call and handed back to the caller,
/// so a single logical accumulator is never reachable from two places.
pub trait Aggregator<Init, Input, Output>: Sized {
    /// Identity accumulator, nothing folded yet
    fn init(init: Init) -> Self;

    /// Fold one input into the accumulator
    fn fold(self, item: Input) -> Self;

    /// Combine two partial accumulators of the same key and window
    fn merge(self, other: Self) -> Self;

    /// `true` when nothing has been folded, such accumulators never produce
    /// output
    fn is_empty(&self) -> bool;

    /// Produce the final value for the given window
    fn finish(self, window: Window) -> Output;
}

/// Result of a window firing for one key
#[derive(Debug, Clone, PartialEq)]
pub struct Fired<Key, Output> {
    pub key: Key,
    pub window: Window,
    pub value: Output,
}

/// Outcome of pushing one item through [`WindowAggregator::process_item`]
#[derive(Debug)]
pub struct Processed<Key, Input, Output> {
    /// Windows closed by the watermark advance this item caused
    pub fired: Vec<Fired<Key, Output>>,
    /// Set when the item belongs to a window that has already fired
    pub late: Option<Input>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum AbsorbError {
    #[error("window {0} is already closed")]
    WindowClosed(Window),
    #[error("window {0} is not aligned to the configured window size")]
    MisalignedWindow(Window),
}

/// A struct for window-based aggregation of time-series data.
///
/// The struct keeps one accumulator per open `(window, key)` pair. An
/// accumulator is created on the first item of its pair and removed as soon
/// as the window fires, nothing outlives its window.
#[derive(Clone, Debug)]
pub struct WindowAggregator<Key, AggInit, AggregatorImpl> {
    /// Open accumulators indexed by window start, then key
    active_windows: BTreeMap<DateTime<Utc>, BTreeMap<Key, AggregatorImpl>>,
    windows: TumblingWindows,
    watermark: BoundedOutOfOrderness,
    agg_init: AggInit,
}

impl<Key: Ord + Clone, AggInit: Clone, AggregatorImpl>
    WindowAggregator<Key, AggInit, AggregatorImpl>
{
    /// Create a new `WindowAggregator` with the given window assigner and
    /// bounded out-of-orderness
    pub fn new(windows: TumblingWindows, bounded_delay: Duration, agg_init: AggInit) -> Self {
        Self {
            active_windows: BTreeMap::new(),
            windows,
            watermark: BoundedOutOfOrderness::new(bounded_delay),
            agg_init,
        }
    }

    pub fn windows(&self) -> TumblingWindows {
        self.windows
    }

    /// Current watermark, `None` until the first item was observed
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.current()
    }

    /// Number of open `(window, key)` accumulators
    pub fn open_windows(&self) -> usize {
        self.active_windows.values().map(BTreeMap::len).sum()
    }

    fn is_closed(&self, window: &Window) -> bool {
        self.watermark
            .current()
            .is_some_and(|watermark| window.is_closed_by(watermark))
    }

    /// Fold the item into its window, update the watermark and fire every
    /// window the watermark has passed.
    pub fn process_item<Input, Output>(&mut self, item: Input) -> Processed<Key, Input, Output>
    where
        Input: TimeSeriesData<Key>,
        AggregatorImpl: Aggregator<AggInit, Input, Output>,
    {
        let ts = item.get_ts();
        let window = self.windows.assign(ts);
        if self.is_closed(&window) {
            return Processed {
                fired: Vec::new(),
                late: Some(item),
            };
        }

        let key = item.get_key();
        let per_key = self.active_windows.entry(window.start).or_default();
        let accumulator = match per_key.remove(&key) {
            Some(accumulator) => accumulator,
            None => AggregatorImpl::init(self.agg_init.clone()),
        };
        per_key.insert(key, accumulator.fold(item));

        self.watermark.observe(ts);
        Processed {
            fired: self.fire_ready::<Input, Output>(),
            late: None,
        }
    }

    /// Advance the watermark from outside the stream (e.g. the combined
    /// watermark of upstream partitions) and fire what it closes.
    pub fn advance_watermark<Input, Output>(
        &mut self,
        watermark: DateTime<Utc>,
    ) -> Vec<Fired<Key, Output>>
    where
        AggregatorImpl: Aggregator<AggInit, Input, Output>,
    {
        self.watermark.advance_to(watermark);
        self.fire_ready::<Input, Output>()
    }

    /// Merge a partial accumulator, typically handed over from another
    /// partition, into the store.
    pub fn absorb<Input, Output>(
        &mut self,
        key: Key,
        window: Window,
        partial: AggregatorImpl,
    ) -> Result<(), AbsorbError>
    where
        AggregatorImpl: Aggregator<AggInit, Input, Output>,
    {
        if self.windows.assign(window.start) != window {
            return Err(AbsorbError::MisalignedWindow(window));
        }
        if self.is_closed(&window) {
            return Err(AbsorbError::WindowClosed(window));
        }
        if partial.is_empty() {
            return Ok(());
        }
        let per_key = self.active_windows.entry(window.start).or_default();
        let merged = match per_key.remove(&key) {
            Some(existing) => existing.merge(partial),
            None => partial,
        };
        per_key.insert(key, merged);
        Ok(())
    }

    /// Remove every open accumulator without firing it, e.g. to hand the
    /// state over to another partition.
    pub fn drain_partials(&mut self) -> Vec<(Key, Window, AggregatorImpl)> {
        let windows = self.windows;
        std::mem::take(&mut self.active_windows)
            .into_iter()
            .flat_map(|(start, per_key)| {
                let window = Window::new(start, windows.end_of(start));
                per_key
                    .into_iter()
                    .map(move |(key, accumulator)| (key, window, accumulator))
            })
            .collect()
    }

    /// Fires the windows whose end the watermark has reached, in increasing
    /// window start order.
    fn fire_ready<Input, Output>(&mut self) -> Vec<Fired<Key, Output>>
    where
        AggregatorImpl: Aggregator<AggInit, Input, Output>,
    {
        let Some(watermark) = self.watermark.current() else {
            return Vec::new();
        };
        let windows = self.windows;
        let mut fired = Vec::new();
        while let Some(entry) = self.active_windows.first_entry() {
            let window = Window::new(*entry.key(), windows.end_of(*entry.key()));
            if !window.is_closed_by(watermark) {
                break;
            }
            fired.extend(finish_window(window, entry.remove()));
        }
        fired
    }

    /// Flushes the current state of the aggregator, firing all open windows
    /// regardless of the watermark. Used for graceful shutdown.
    pub fn flush<Input, Output>(&mut self) -> Vec<Fired<Key, Output>>
    where
        AggregatorImpl: Aggregator<AggInit, Input, Output>,
    {
        let windows = self.windows;
        let active_windows = std::mem::take(&mut self.active_windows);
        if let Some(last_start) = active_windows.keys().next_back() {
            // Anything arriving for a flushed window afterwards is late
            self.watermark.advance_to(windows.end_of(*last_start));
        }
        active_windows
            .into_iter()
            .flat_map(|(start, per_key)| {
                finish_window(Window::new(start, windows.end_of(start)), per_key)
            })
            .collect()
    }
}

fn finish_window<Key, AggInit, Input, Output, AggregatorImpl>(
    window: Window,
    per_key: BTreeMap<Key, AggregatorImpl>,
) -> impl Iterator<Item = Fired<Key, Output>>
where
    AggregatorImpl: Aggregator<AggInit, Input, Output>,
{
    per_key
        .into_iter()
        .filter(|(_, accumulator)| !accumulator.is_empty())
        .map(move |(key, accumulator)| Fired {
            key,
            window,
            value: accumulator.finish(window),
        })
}

/// An iterator adaptor that provides an ergonomic API for window-based
/// aggregation
///
/// Yields `Left` for every emitted window result and `Right` for late items.
/// When the source is exhausted all open windows are flushed.
pub struct WindowedAggregationAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    I: Iterator<Item = Input>,
{
    source: I,
    aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>,
    buffer: VecDeque<Fired<Key, Output>>,
    late_buffer: VecDeque<Input>,
    flushed: bool,
}

impl<Key, Input, AggInit, Output, AggregatorImpl, I>
    WindowedAggregationAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    Key: Ord + Clone,
    Input: TimeSeriesData<Key>,
    AggInit: Clone,
    AggregatorImpl: Aggregator<AggInit, Input, Output>,
    I: Iterator<Item = Input>,
{
    fn new(source: I, aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>) -> Self {
        Self {
            source,
            aggregator,
            buffer: VecDeque::new(),
            late_buffer: VecDeque::new(),
            flushed: false,
        }
    }

    pub fn aggregator(&self) -> &WindowAggregator<Key, AggInit, AggregatorImpl> {
        &self.aggregator
    }

    #[inline]
    fn get_next(&mut self) -> Option<either::Either<Fired<Key, Output>, Input>> {
        if let Some(late) = self.late_buffer.pop_front() {
            return Some(either::Right(late));
        }
        if let Some(fired) = self.buffer.pop_front() {
            return Some(either::Left(fired));
        }
        None
    }
}

impl<Key, Input, AggInit, Output, AggregatorImpl, I> Iterator
    for WindowedAggregationAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    Key: Ord + Clone,
    Input: TimeSeriesData<Key>,
    AggInit: Clone,
    AggregatorImpl: Aggregator<AggInit, Input, Output>,
    I: Iterator<Item = Input>,
{
    type Item = either::Either<Fired<Key, Output>, Input>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(next) = self.get_next() {
                return Some(next);
            }
            if self.flushed {
                return None;
            }
            match self.source.next() {
                Some(item) => {
                    let processed = self.aggregator.process_item(item);
                    self.buffer.extend(processed.fired);
                    self.late_buffer.extend(processed.late);
                }
                None => {
                    // Source is exhausted, flush remaining windows
                    self.buffer.extend(self.aggregator.flush());
                    self.flushed = true;
                }
            }
        }
    }
}

pub trait AggregationWindowingExt: Iterator + Sized {
    fn window_aggregate<Key, AggInit, Output, AggregatorImpl>(
        self,
        aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>,
    ) -> WindowedAggregationAdaptor<Key, Self::Item, AggInit, Output, AggregatorImpl, Self>
    where
        Key: Ord + Clone,
        Self::Item: TimeSeriesData<Key>,
        AggInit: Clone,
        AggregatorImpl: Aggregator<AggInit, Self::Item, Output>,
    {
        WindowedAggregationAdaptor::new(self, aggregator)
    }
}

impl<I: Iterator> AggregationWindowingExt for I {}

/// Stream counterpart of [`WindowedAggregationAdaptor`]
#[pin_project]
pub struct WindowedAggregationStreamAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    I: Stream<Item = Input>,
{
    #[pin]
    source: I,
    aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>,
    buffer: VecDeque<Fired<Key, Output>>,
    late_buffer: VecDeque<Input>,
    flushed: bool,
}

impl<Key, Input, AggInit, Output, AggregatorImpl, I>
    WindowedAggregationStreamAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    Key: Ord + Clone,
    Input: TimeSeriesData<Key>,
    AggInit: Clone,
    AggregatorImpl: Aggregator<AggInit, Input, Output>,
    I: Stream<Item = Input>,
{
    pub fn new(source: I, aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>) -> Self {
        Self {
            source,
            aggregator,
            buffer: VecDeque::new(),
            late_buffer: VecDeque::new(),
            flushed: false,
        }
    }

    pub fn aggregator(&self) -> &WindowAggregator<Key, AggInit, AggregatorImpl> {
        &self.aggregator
    }
}

impl<Key, Input, AggInit, Output, AggregatorImpl, I> Stream
    for WindowedAggregationStreamAdaptor<Key, Input, AggInit, Output, AggregatorImpl, I>
where
    Key: Ord + Clone,
    Input: TimeSeriesData<Key>,
    AggInit: Clone,
    AggregatorImpl: Aggregator<AggInit, Input, Output>,
    I: Stream<Item = Input>,
{
    type Item = either::Either<Fired<Key, Output>, Input>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            // First, return any buffered results
            if let Some(late) = this.late_buffer.pop_front() {
                return Poll::Ready(Some(either::Right(late)));
            }
            if let Some(fired) = this.buffer.pop_front() {
                return Poll::Ready(Some(either::Left(fired)));
            }
            if *this.flushed {
                return Poll::Ready(None);
            }
            match this.source.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    let processed = this.aggregator.process_item(item);
                    this.buffer.extend(processed.fired);
                    this.late_buffer.extend(processed.late);
                }
                Poll::Ready(None) => {
                    // Source is exhausted, flush remaining windows
                    this.buffer.extend(this.aggregator.flush());
                    *this.flushed = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub trait AggregationWindowStreamExt: Stream + Sized {
    fn window_aggregate<Key, AggInit, Output, AggregatorImpl>(
        self,
        aggregator: WindowAggregator<Key, AggInit, AggregatorImpl>,
    ) -> WindowedAggregationStreamAdaptor<Key, Self::Item, AggInit, Output, AggregatorImpl, Self>
    where
        Key: Ord + Clone,
        Self::Item: TimeSeriesData<Key>,
        AggInit: Clone,
        AggregatorImpl: Aggregator<AggInit, Self::Item, Output>,
    {
        WindowedAggregationStreamAdaptor::new(self, aggregator)
    }
}

impl<S: Stream> AggregationWindowStreamExt for S {}
