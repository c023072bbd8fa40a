use crate::error::AppError;
use crate::market::aggregator::{Aggregator, BucketEvent, TradeApplyOutcome};
use crate::market::series::{CloseOutcome, SeriesStore, UpsertOutcome};
use crate::market::types::{
    parse_feed_message, BinSize, Candle, ChartStatusSnapshot, FeedState, TradeEvent,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consumer of the candle series. Rendering itself happens elsewhere.
pub trait RenderSink {
    fn replace_all(&mut self, candles: &[Candle]);

    fn upsert(&mut self, candle: &Candle);

    fn status_changed(&mut self, _status: &ChartStatusSnapshot) {}
}

/// One-shot provider of closed candles for a bin size.
pub trait HistoricalSource {
    fn fetch_candles(
        &self,
        bin_size: &BinSize,
    ) -> impl Future<Output = Result<Vec<Candle>, AppError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub generation: u64,
    pub bin_size: BinSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { candles: usize, subscribe: bool },
    Failed(String),
    Stale { generation: u64, current: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOutcome {
    pub applied: usize,
    pub rejected: usize,
    pub stale: usize,
    pub replayed: usize,
    pub ignored: bool,
}

/// Last trade folded into the aggregator, used to skip rows a `partial`
/// frame replays after a (re)subscribe.
#[derive(Debug, Default)]
struct AppliedTradeMark {
    timestamp_ms: Option<i64>,
    match_ids: Vec<String>,
}

impl AppliedTradeMark {
    fn covers(&self, timestamp_ms: i64, match_id: Option<&str>) -> bool {
        match self.timestamp_ms {
            Some(last) if timestamp_ms < last => true,
            Some(last) if timestamp_ms == last => match match_id {
                Some(id) => self.match_ids.iter().any(|seen| seen == id),
                None => true,
            },
            _ => false,
        }
    }

    fn record(&mut self, timestamp_ms: i64, match_id: Option<String>) {
        if self.timestamp_ms != Some(timestamp_ms) {
            self.timestamp_ms = Some(timestamp_ms);
            self.match_ids.clear();
        }
        if let Some(id) = match_id {
            self.match_ids.push(id);
        }
    }

    fn clear(&mut self) {
        self.timestamp_ms = None;
        self.match_ids.clear();
    }
}

/// Owns the aggregator and the series for one symbol/bin-size chart and
/// drives them through the load, live and reconnect lifecycle.
pub struct FeedController<K: RenderSink> {
    symbol: String,
    bin_size: BinSize,
    state: FeedState,
    generation: u64,
    feed_attached: bool,
    subscribed: bool,
    aggregator: Aggregator,
    applied_mark: AppliedTradeMark,
    store: SeriesStore,
    sink: K,
    status_store: Arc<RwLock<ChartStatusSnapshot>>,
}

impl<K: RenderSink> FeedController<K> {
    pub fn new(
        symbol: String,
        bin_size: BinSize,
        sink: K,
        status_store: Arc<RwLock<ChartStatusSnapshot>>,
    ) -> Self {
        Self {
            symbol,
            bin_size,
            state: FeedState::Idle,
            generation: 0,
            feed_attached: false,
            subscribed: false,
            aggregator: Aggregator::default(),
            applied_mark: AppliedTradeMark::default(),
            store: SeriesStore::default(),
            sink,
            status_store,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bin_size(&self) -> &BinSize {
        &self.bin_size
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn start(&mut self) -> LoadRequest {
        self.begin_load()
    }

    /// Manual retry always issues a fresh load; any older fetch becomes stale.
    pub fn retry(&mut self) -> LoadRequest {
        info!(symbol = %self.symbol, bin_size = %self.bin_size, "retrying historical load");
        self.begin_load()
    }

    pub fn switch_timeframe(&mut self, bin_size: BinSize) -> LoadRequest {
        info!(
            symbol = %self.symbol,
            from = %self.bin_size,
            to = %bin_size,
            "switching timeframe"
        );
        self.aggregator.reset();
        self.applied_mark.clear();
        self.store.clear();
        self.sink.replace_all(&[]);
        self.bin_size = bin_size;
        self.transition(FeedState::Idle, Some("timeframe switched".to_string()));
        self.begin_load()
    }

    fn begin_load(&mut self) -> LoadRequest {
        self.generation = self.generation.saturating_add(1);
        let reason = format!("loading {} candles", self.bin_size);
        self.transition(FeedState::Loading, Some(reason));
        LoadRequest {
            generation: self.generation,
            bin_size: self.bin_size.clone(),
        }
    }

    pub fn complete_load(
        &mut self,
        generation: u64,
        result: Result<Vec<Candle>, AppError>,
    ) -> LoadOutcome {
        if generation != self.generation || self.state != FeedState::Loading {
            debug!(
                generation,
                current = self.generation,
                state = self.state.as_str(),
                "discarding stale historical response"
            );
            return LoadOutcome::Stale {
                generation,
                current: self.generation,
            };
        }

        let candles = match result {
            Ok(candles) if candles.is_empty() => {
                return self.fail_load("no data available, retry".to_string());
            }
            Ok(candles) => candles,
            Err(error) => {
                let reason = match error {
                    AppError::FetchFailed(_)
                    | AppError::InvalidPayload(_)
                    | AppError::InvalidSnapshot(_) => error.to_string(),
                    other if other.is_connectivity() => {
                        AppError::FetchFailed(other.to_string()).to_string()
                    }
                    other => AppError::InvalidPayload(other.to_string()).to_string(),
                };
                return self.fail_load(format!("{reason}, retry"));
            }
        };

        if let Err(error) = self.store.load_snapshot(candles) {
            return self.fail_load(error.to_string());
        }

        self.aggregator.reset();
        self.applied_mark.clear();
        let view = self.store.current_view();
        self.sink.replace_all(&view);

        let subscribe = self.feed_attached && !self.subscribed;
        if subscribe {
            self.subscribed = true;
        }

        let next_state = if self.feed_attached {
            FeedState::Live
        } else {
            FeedState::Reconnecting
        };
        info!(
            symbol = %self.symbol,
            bin_size = %self.bin_size,
            generation,
            candles = view.len(),
            "historical candles loaded"
        );
        self.transition(next_state, Some(format!("chart loaded: {} candles", view.len())));

        LoadOutcome::Loaded {
            candles: view.len(),
            subscribe,
        }
    }

    fn fail_load(&mut self, reason: String) -> LoadOutcome {
        warn!(
            symbol = %self.symbol,
            bin_size = %self.bin_size,
            generation = self.generation,
            reason = %reason,
            "historical load failed"
        );
        self.transition(FeedState::LoadFailed, Some(reason.clone()));
        LoadOutcome::Failed(reason)
    }

    /// Returns whether a subscription must be sent on the fresh connection.
    /// Before the first snapshot lands the subscription is deferred to
    /// [`Self::complete_load`].
    pub fn on_feed_opened(&mut self) -> bool {
        self.feed_attached = true;
        self.subscribed = false;

        match self.state {
            FeedState::Live | FeedState::Reconnecting => {
                self.subscribed = true;
                self.transition(FeedState::Live, Some("live feed connected".to_string()));
                true
            }
            _ => {
                debug!(
                    state = self.state.as_str(),
                    "live feed open, subscription deferred until history loads"
                );
                false
            }
        }
    }

    /// The forming bar is kept so a reconnect resumes the same bucket.
    pub fn on_feed_closed(&mut self, reason: &str) {
        self.feed_attached = false;
        self.subscribed = false;

        let error = AppError::FeedDisconnected(reason.to_string());
        match self.state {
            FeedState::Live | FeedState::Reconnecting => {
                warn!(symbol = %self.symbol, reason = %reason, "live feed disconnected");
                self.transition(FeedState::Reconnecting, Some(error.to_string()));
            }
            _ => {
                debug!(state = self.state.as_str(), reason = %reason, "live feed closed");
            }
        }
    }

    pub fn stop(&mut self) {
        self.feed_attached = false;
        self.subscribed = false;
        self.transition(FeedState::Stopped, Some("stream stopped".to_string()));
    }

    pub fn on_feed_message(&mut self, payload: &mut [u8]) -> MessageOutcome {
        let mut outcome = MessageOutcome::default();

        let (replay, trades) = match parse_feed_message(payload) {
            Ok(message) => (message.is_partial(), message.into_trades()),
            Err(error) => {
                debug!(error = %error, "ignoring undecodable feed frame");
                (false, None)
            }
        };
        let Some(trades) = trades else {
            outcome.ignored = true;
            return outcome;
        };

        if self.state != FeedState::Live {
            debug!(
                state = self.state.as_str(),
                rows = trades.len(),
                "dropping trades outside live state"
            );
            outcome.ignored = true;
            return outcome;
        }

        for row in trades {
            let match_id = row.trd_match_id.clone();
            let trade = match TradeEvent::try_from(row) {
                Ok(trade) => trade,
                Err(error) => {
                    debug!(error = %error, "rejecting malformed trade");
                    outcome.rejected += 1;
                    continue;
                }
            };

            if replay && self.applied_mark.covers(trade.timestamp_ms, match_id.as_deref()) {
                outcome.replayed += 1;
                continue;
            }

            match self.on_trade(&trade) {
                Some(TradeApplyOutcome::Applied { .. }) => {
                    self.applied_mark.record(trade.timestamp_ms, match_id);
                    outcome.applied += 1;
                }
                Some(TradeApplyOutcome::Stale { .. }) => outcome.stale += 1,
                Some(TradeApplyOutcome::Rejected(_)) => outcome.rejected += 1,
                None => outcome.ignored = true,
            }
        }

        outcome
    }

    /// Routes one trade while live; `None` when the chart is not accepting trades.
    pub fn on_trade(&mut self, trade: &TradeEvent) -> Option<TradeApplyOutcome> {
        if self.state != FeedState::Live {
            return None;
        }

        let outcome = self.aggregator.on_trade(trade, self.bin_size.seconds());
        match &outcome {
            TradeApplyOutcome::Rejected(reason) => {
                debug!(reason = %reason, "trade rejected");
            }
            TradeApplyOutcome::Stale {
                bucket_time,
                current_time,
            } => {
                debug!(bucket_time, current_time, "dropping out-of-order trade");
            }
            TradeApplyOutcome::Applied { .. } => {}
        }

        for event in outcome.events() {
            self.apply_bucket_event(event);
        }

        Some(outcome)
    }

    fn apply_bucket_event(&mut self, event: BucketEvent) {
        match event {
            BucketEvent::Closed(bucket) => match self.store.apply_bucket_closed(&bucket) {
                CloseOutcome::Appended => self.sink.upsert(&bucket),
                CloseOutcome::AppendedPastForming { forming_time } => {
                    warn!(
                        symbol = %self.symbol,
                        bucket_time = bucket.time,
                        forming_time,
                        "bucket close skipped past the forming bar"
                    );
                    self.sink.upsert(&bucket);
                }
                CloseOutcome::Duplicate => {
                    debug!(bucket_time = bucket.time, "ignoring duplicate bucket close");
                }
                CloseOutcome::OrderingAnomaly { last_time } => {
                    let anomaly = AppError::OrderingAnomaly {
                        bucket_time: bucket.time,
                        last_time,
                    };
                    warn!(symbol = %self.symbol, error = %anomaly, "bucket close out of order");
                }
            },
            BucketEvent::Updated(bucket) => match self.store.apply_bucket_updated(&bucket) {
                UpsertOutcome::Applied => self.sink.upsert(&bucket),
                UpsertOutcome::Ignored => {
                    debug!(
                        bucket_time = bucket.time,
                        "bucket update does not extend the series"
                    );
                }
            },
        }
    }

    fn transition(&mut self, state: FeedState, reason: Option<String>) {
        self.state = state;
        let snapshot = ChartStatusSnapshot {
            state,
            symbol: self.symbol.clone(),
            bin_size: self.bin_size.clone(),
            generation: self.generation,
            candle_count: self.store.len(),
            forming_time: self.store.forming_bar().map(|bar| bar.time),
            reason,
        };

        {
            let mut writable = self.status_store.write();
            *writable = snapshot.clone();
        }
        self.sink.status_changed(&snapshot);
    }
}
