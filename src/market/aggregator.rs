use crate::error::AppError;
use crate::market::types::{Candle, TradeEvent};

/// Bucket lifecycle transitions, in the order they must reach the series.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketEvent {
    Closed(Candle),
    Updated(Candle),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeApplyOutcome {
    Applied {
        closed: Option<Candle>,
        updated: Candle,
    },
    Stale {
        bucket_time: i64,
        current_time: i64,
    },
    Rejected(String),
}

impl TradeApplyOutcome {
    pub fn events(&self) -> Vec<BucketEvent> {
        match self {
            Self::Applied {
                closed: Some(closed),
                updated,
            } => vec![
                BucketEvent::Closed(closed.clone()),
                BucketEvent::Updated(updated.clone()),
            ],
            Self::Applied {
                closed: None,
                updated,
            } => vec![BucketEvent::Updated(updated.clone())],
            Self::Stale { .. } | Self::Rejected(_) => Vec::new(),
        }
    }
}

/// Folds trades into the single forming bucket. Holds no other state.
#[derive(Debug, Default)]
pub struct Aggregator {
    current: Option<Candle>,
}

impl Aggregator {
    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn on_trade(&mut self, trade: &TradeEvent, bin_width_seconds: i64) -> TradeApplyOutcome {
        if let Err(error) = validate_trade(trade, bin_width_seconds) {
            return TradeApplyOutcome::Rejected(error.to_string());
        }

        let bucket_time = bucket_open_time(trade.timestamp_ms, bin_width_seconds);

        match self.current.as_mut() {
            Some(current) if bucket_time < current.time => TradeApplyOutcome::Stale {
                bucket_time,
                current_time: current.time,
            },
            Some(current) if bucket_time == current.time => {
                current.absorb(trade.price, trade.size);
                TradeApplyOutcome::Applied {
                    closed: None,
                    updated: current.clone(),
                }
            }
            _ => {
                let next = Candle::create(bucket_time, trade.price, trade.size);
                let closed = self.current.replace(next.clone());
                TradeApplyOutcome::Applied {
                    closed,
                    updated: next,
                }
            }
        }
    }
}

fn validate_trade(trade: &TradeEvent, bin_width_seconds: i64) -> Result<(), AppError> {
    if bin_width_seconds <= 0 {
        return Err(AppError::InvalidArgument(format!(
            "bin width must be positive, got {bin_width_seconds}"
        )));
    }
    trade.validate()
}

/// `floor(timestamp_ms / 1000 / bin) * bin`, flooring toward negative infinity.
pub fn bucket_open_time(timestamp_ms: i64, bin_width_seconds: i64) -> i64 {
    let seconds = timestamp_ms.div_euclid(1_000);
    seconds - seconds.rem_euclid(bin_width_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(timestamp_ms: i64, price: f64, size: f64) -> TradeEvent {
        TradeEvent {
            timestamp_ms,
            price,
            size,
        }
    }

    #[test]
    fn aligns_bucket_to_bin_boundary() {
        assert_eq!(bucket_open_time(0, 60), 0);
        assert_eq!(bucket_open_time(59_999, 60), 0);
        assert_eq!(bucket_open_time(61_000, 60), 60);
        assert_eq!(bucket_open_time(3_599_999, 3_600), 0);
        assert_eq!(bucket_open_time(-1, 60), -60);
    }

    #[test]
    fn first_trade_opens_bucket_without_closing() {
        let mut aggregator = Aggregator::default();
        let outcome = aggregator.on_trade(&trade(30_000, 100.0, 1.0), 60);

        assert_eq!(
            outcome,
            TradeApplyOutcome::Applied {
                closed: None,
                updated: Candle::create(0, 100.0, 1.0),
            }
        );
    }

    #[test]
    fn rolling_bucket_closes_previous_once() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(0, 100.0, 1.0), 60);
        let _ = aggregator.on_trade(&trade(30_000, 105.0, 2.0), 60);
        let events = aggregator
            .on_trade(&trade(61_000, 102.0, 1.0), 60)
            .events();

        assert_eq!(
            events,
            vec![
                BucketEvent::Closed(Candle {
                    time: 0,
                    open: 100.0,
                    high: 105.0,
                    low: 100.0,
                    close: 105.0,
                    volume: 3.0,
                }),
                BucketEvent::Updated(Candle::create(60, 102.0, 1.0)),
            ]
        );
    }

    #[test]
    fn gap_in_trades_skips_empty_buckets() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(10_000, 100.0, 1.0), 60);
        let outcome = aggregator.on_trade(&trade(610_000, 99.0, 1.0), 60);

        let TradeApplyOutcome::Applied { closed, updated } = outcome else {
            panic!("trade should apply");
        };
        assert_eq!(closed.map(|candle| candle.time), Some(0));
        assert_eq!(updated.time, 600);
    }

    #[test]
    fn drops_out_of_order_trade_without_mutation() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(61_000, 102.0, 1.0), 60);
        let before = aggregator.current().cloned();

        let outcome = aggregator.on_trade(&trade(59_000, 500.0, 9.0), 60);

        assert_eq!(
            outcome,
            TradeApplyOutcome::Stale {
                bucket_time: 0,
                current_time: 60,
            }
        );
        assert_eq!(aggregator.current().cloned(), before);
    }

    #[test]
    fn rejects_invalid_trades_without_mutation() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(1_000, 100.0, 1.0), 60);
        let before = aggregator.current().cloned();

        for bad in [
            trade(2_000, f64::NAN, 1.0),
            trade(2_000, 0.0, 1.0),
            trade(2_000, -5.0, 1.0),
            trade(2_000, 100.0, -1.0),
            trade(2_000, 100.0, f64::INFINITY),
        ] {
            let outcome = aggregator.on_trade(&bad, 60);
            assert!(matches!(outcome, TradeApplyOutcome::Rejected(_)));
            assert!(outcome.events().is_empty());
        }

        assert_eq!(aggregator.current().cloned(), before);
    }

    #[test]
    fn rejected_first_trade_creates_no_bucket() {
        let mut aggregator = Aggregator::default();
        let outcome = aggregator.on_trade(&trade(1_000, 100.0, -2.0), 60);

        assert!(matches!(outcome, TradeApplyOutcome::Rejected(_)));
        assert!(aggregator.current().is_none());
    }

    #[test]
    fn reset_discards_forming_bucket() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(1_000, 100.0, 1.0), 60);
        aggregator.reset();

        assert!(aggregator.current().is_none());
        let outcome = aggregator.on_trade(&trade(2_000, 101.0, 1.0), 60);
        assert!(matches!(
            outcome,
            TradeApplyOutcome::Applied { closed: None, .. }
        ));
    }

    #[test]
    fn aggregates_with_hour_bins() {
        let mut aggregator = Aggregator::default();
        let _ = aggregator.on_trade(&trade(3_600_000, 10.0, 1.0), 3_600);
        let outcome = aggregator.on_trade(&trade(7_199_000, 12.0, 1.0), 3_600);

        let TradeApplyOutcome::Applied { closed, updated } = outcome else {
            panic!("trade should apply");
        };
        assert!(closed.is_none());
        assert_eq!(updated.time, 3_600);
        assert_eq!(updated.high, 12.0);
    }
}
