use crate::market::series::Series;
use crate::market::types::{Candle, PricePoint};
use std::time::Duration;
use tokio::time::Instant;

/// Conflates incoming ticks and releases at most one per window into a `Series`.
/// Within a window only the latest tick survives; earlier ones are discarded.
#[derive(Debug, Clone)]
pub struct ThrottledAggregator {
    window: Duration,
    pending: Option<PricePoint>,
    last_emit: Option<Instant>,
    dropped: u64,
}

impl ThrottledAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            last_emit: None,
            dropped: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn push(&mut self, point: PricePoint) {
        if self.pending.replace(point).is_some() {
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Appends the pending tick when the window since the last emission has elapsed.
    /// Returns true when `series` changed and a new snapshot should be published.
    ///
    /// `now` is the flush slot on the window grid, not the wake-up time: late wake-ups
    /// would otherwise push the next slot past the window and skip an emission.
    pub fn flush_into(&mut self, now: Instant, series: &mut Series) -> bool {
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }

        let Some(point) = self.pending.take() else {
            return false;
        };

        self.last_emit = Some(now);
        series.push(Candle::from(point))
    }
}
