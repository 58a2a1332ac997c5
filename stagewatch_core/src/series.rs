use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Start of the one-second slot containing `timestamp`.
///
/// Counter deltas, gauge values and histogram buckets are coalesced per slot,
/// so a series holds at most one entry per second however fast it is
/// written.
pub fn slot_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp)
}

/// Time-ordered samples for a single instrument.
///
/// The series is bounded twice: by age (trimmed by the retention sweeper)
/// and by length (`capacity`, enforced on every push). Neither bound ever
/// removes the newest sample.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl TimeSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends a sample, keeping time order even if the caller's clock is
    /// behind the newest sample already stored.
    pub fn push(&mut self, sample: Sample) {
        match self.samples.back() {
            Some(last) if sample.timestamp < last.timestamp => {
                let index = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(index, sample);
            }
            _ => self.samples.push_back(sample),
        }

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Adds `sample.value` to the sample of its one-second slot, creating the
    /// slot if needed.
    pub fn accumulate(&mut self, sample: Sample) {
        let start = slot_start(sample.timestamp);
        match self.slot_mut(start) {
            Some(slot) => slot.value += sample.value,
            None => self.push(Sample::new(start, sample.value)),
        }
    }

    /// Stores `sample.value` as the value of its one-second slot, replacing
    /// whatever the slot held.
    pub fn replace(&mut self, sample: Sample) {
        let start = slot_start(sample.timestamp);
        match self.slot_mut(start) {
            Some(slot) => slot.value = sample.value,
            None => self.push(Sample::new(start, sample.value)),
        }
    }

    fn slot_mut(&mut self, start: DateTime<Utc>) -> Option<&mut Sample> {
        let index = self.samples.partition_point(|s| s.timestamp < start);
        self.samples.get_mut(index).filter(|s| s.timestamp == start)
    }

    /// Drops samples strictly older than `cutoff`, always keeping the most
    /// recent one. Returns the number of samples removed.
    pub fn trim_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(front) if front.timestamp < cutoff => {
                    self.samples.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }
        removed
    }

    /// Samples with `from <= timestamp <= to`.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> impl Iterator<Item = &Sample> {
        let start = self.samples.partition_point(|s| s.timestamp < from);
        self.samples
            .range(start..)
            .take_while(move |s| s.timestamp <= to)
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&Sample> {
        self.samples.front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }
}

/// One-second slot of histogram bucket counts.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSlot {
    pub start: DateTime<Utc>,
    /// Non-cumulative, one entry per bound plus `+Inf`.
    pub counts: Vec<u64>,
}

/// Histogram observations bucketed per one-second slot, so windowed
/// percentiles see every observation in the window.
#[derive(Debug, Clone)]
pub struct BucketSeries {
    slots: VecDeque<BucketSlot>,
    buckets: usize,
    capacity: usize,
}

impl BucketSeries {
    pub fn new(buckets: usize, capacity: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            buckets,
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, bucket: usize) {
        let start = slot_start(timestamp);
        let index = self.slots.partition_point(|s| s.start < start);
        match self.slots.get_mut(index) {
            Some(slot) if slot.start == start => slot.counts[bucket] += 1,
            _ => {
                let mut counts = vec![0; self.buckets];
                counts[bucket] = 1;
                self.slots.insert(index, BucketSlot { start, counts });
            }
        }

        while self.slots.len() > self.capacity {
            self.slots.pop_front();
        }
    }

    /// Same contract as [`TimeSeries::trim_before`].
    pub fn trim_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self.slots.len() > 1 && self.slots.front().is_some_and(|s| s.start < cutoff) {
            self.slots.pop_front();
            removed += 1;
        }
        removed
    }

    /// Per-bucket totals over the slots starting in `[from, to]`.
    pub fn window_counts(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<u64> {
        let mut totals = vec![0; self.buckets];
        let start = self.slots.partition_point(|s| s.start < from);
        for slot in self.slots.range(start..).take_while(|s| s.start <= to) {
            for (total, count) in totals.iter_mut().zip(&slot.counts) {
                *total += count;
            }
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// `now - window`, saturating instead of overflowing for absurd windows.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
