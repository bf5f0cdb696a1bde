use chrono::{DateTime, Duration, TimeZone, Utc};
use trading_core::{Bar, Tick};

/// Folds ticks for one symbol into fixed-duration OHLCV bars.
///
/// Buckets are aligned to multiples of `bar_duration` since the Unix epoch.
/// A bar is emitted once a tick lands in a later bucket:
/// - open = first tick price
/// - high / low = extreme tick prices
/// - close = last tick price
/// - volume = sum of tick volumes
#[derive(Debug, Clone)]
pub struct BarAggregator {
    bar_duration: Duration,
    current: Option<Bar>,
}

impl BarAggregator {
    pub fn new(bar_duration: Duration) -> Self {
        let bar_duration = if bar_duration <= Duration::zero() {
            Duration::seconds(60)
        } else {
            bar_duration
        };
        Self {
            bar_duration,
            current: None,
        }
    }

    pub fn bar_duration(&self) -> Duration {
        self.bar_duration
    }

    /// Add a tick. Returns the completed bar when the tick opens a new bucket.
    pub fn push(&mut self, tick: &Tick) -> Option<Bar> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            tracing::debug!("Dropping tick with invalid price {} for {}", tick.price, tick.symbol);
            return None;
        }

        let bucket = self.bucket_start(tick.timestamp);

        match &mut self.current {
            Some(bar) if bar.timestamp == bucket => {
                bar.high = bar.high.max(tick.price);
                bar.low = bar.low.min(tick.price);
                bar.close = tick.price;
                bar.volume += tick.volume.max(0.0);
                None
            }
            Some(bar) if bucket < bar.timestamp => {
                tracing::debug!(
                    "Dropping late tick for {} at {} (current bar {})",
                    tick.symbol,
                    tick.timestamp,
                    bar.timestamp
                );
                None
            }
            _ => {
                let completed = self.current.take();
                self.current = Some(Bar {
                    timestamp: bucket,
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.volume.max(0.0),
                });
                completed
            }
        }
    }

    /// The bar currently being built, if any.
    pub fn partial(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bar_duration.num_milliseconds().max(1);
        let millis = ts.timestamp_millis();
        let start = millis - millis.rem_euclid(width);
        Utc.timestamp_millis_opt(start).single().unwrap_or(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(secs: i64, price: f64, volume: f64) -> Tick {
        Tick {
            symbol: "SPY".to_string(),
            price,
            volume,
            timestamp: Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn emits_bar_when_bucket_rolls() {
        let mut agg = BarAggregator::new(Duration::seconds(60));
        assert!(agg.push(&tick(0, 100.0, 10.0)).is_none());
        assert!(agg.push(&tick(10, 101.5, 5.0)).is_none());
        assert!(agg.push(&tick(20, 99.5, 5.0)).is_none());
        assert!(agg.push(&tick(30, 100.5, 1.0)).is_none());

        let bar = agg.push(&tick(60, 102.0, 3.0)).expect("bar should complete");
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 101.5);
        assert_eq!(bar.low, 99.5);
        assert_eq!(bar.close, 100.5);
        assert_eq!(bar.volume, 21.0);
        assert_eq!(bar.timestamp.timestamp() % 60, 0);

        let partial = agg.partial().unwrap();
        assert_eq!(partial.open, 102.0);
    }

    #[test]
    fn drops_late_ticks() {
        let mut agg = BarAggregator::new(Duration::seconds(60));
        agg.push(&tick(0, 100.0, 1.0));
        agg.push(&tick(60, 101.0, 1.0));
        assert!(agg.push(&tick(5, 50.0, 1.0)).is_none());
        assert_eq!(agg.partial().unwrap().low, 101.0);
    }

    #[test]
    fn ignores_non_positive_prices() {
        let mut agg = BarAggregator::new(Duration::seconds(60));
        assert!(agg.push(&tick(0, 0.0, 1.0)).is_none());
        assert!(agg.partial().is_none());
    }
}
