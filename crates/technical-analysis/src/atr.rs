use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::indicators::true_range;

/// Incremental Average True Range.
///
/// Keeps the last `period` true ranges and a running sum: each update appends
/// the newest true range and evicts the oldest once the window is full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrTracker {
    period: usize,
    ranges: VecDeque<f64>,
    sum: f64,
    prev_close: Option<f64>,
}

impl AtrTracker {
    pub const DEFAULT_PERIOD: usize = 14;

    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            ranges: VecDeque::with_capacity(period),
            sum: 0.0,
            prev_close: None,
        }
    }

    /// Feed one bar. Returns the ATR once `period` true ranges have been seen.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let tr = true_range(high, low, self.prev_close);
        self.prev_close = Some(close);

        self.ranges.push_back(tr);
        self.sum += tr;
        if self.ranges.len() > self.period {
            if let Some(oldest) = self.ranges.pop_front() {
                self.sum -= oldest;
            }
        }

        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.ranges.len() == self.period {
            Some((self.sum / self.period as f64).max(0.0))
        } else {
            None
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn is_warm(&self) -> bool {
        self.ranges.len() == self.period
    }
}

impl Default for AtrTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_after_period_bars() {
        let mut atr = AtrTracker::new(3);
        assert_eq!(atr.update(101.0, 99.0, 100.0), None);
        assert_eq!(atr.update(102.0, 100.0, 101.0), None);
        let value = atr.update(103.0, 101.0, 102.0).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn evicts_oldest_range() {
        let mut atr = AtrTracker::new(2);
        atr.update(110.0, 100.0, 105.0); // TR 10
        atr.update(106.0, 104.0, 105.0); // TR 2
        let value = atr.update(106.0, 104.0, 105.0).unwrap(); // TR 2, first evicted
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn gap_uses_previous_close() {
        let mut atr = AtrTracker::new(1);
        atr.update(101.0, 99.0, 100.0);
        // Gap up: high-low is 1 but |low - prev_close| is 10
        let value = atr.update(111.0, 110.0, 110.5).unwrap();
        assert!((value - 11.0).abs() < 1e-9);
    }

    #[test]
    fn constant_range_gives_constant_atr() {
        let mut atr = AtrTracker::default();
        let mut last = None;
        for _ in 0..20 {
            last = atr.update(502.5, 497.5, 500.0);
        }
        assert!((last.unwrap() - 5.0).abs() < 1e-9);
    }
}
