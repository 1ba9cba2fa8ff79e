use crate::market::types::Candle;
use std::collections::VecDeque;

/// Time-ascending sliding window of candles, never longer than `capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    points: VecDeque<Candle>,
    capacity: usize,
}

impl Series {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Builds a series from an unordered batch: sorts by timestamp, keeps the last row
    /// for duplicated timestamps, and retains only the newest `capacity` entries.
    pub fn from_unordered(mut candles: Vec<Candle>, capacity: usize) -> Self {
        let mut series = Self::with_capacity(capacity);

        candles.sort_by_key(|candle| candle.timestamp_ms);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.timestamp_ms == candle.timestamp_ms => *last = candle,
                _ => deduped.push(candle),
            }
        }

        let overflow = deduped.len().saturating_sub(series.capacity);
        series.points.extend(deduped.into_iter().skip(overflow));
        series
    }

    /// Appends one point at the tail, evicting the oldest entry when full. Points older
    /// than the current tail are rejected so already published entries never move.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.points.back() {
            if candle.timestamp_ms < last.timestamp_ms {
                return false;
            }
        }

        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(candle);
        true
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&Candle> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.points.iter().copied().collect()
    }
}
