use crate::error::AppError;
use crate::market::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Appended,
    /// Appended, but a forming bar older than the closed bucket was discarded.
    AppendedPastForming { forming_time: i64 },
    Duplicate,
    OrderingAnomaly { last_time: i64 },
}

/// Closed bars plus at most one forming bar, strictly increasing in `time`.
///
/// Nothing else mutates the closed sequence; every write path here keeps the
/// concatenation of closed and forming bars duplicate-free.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeriesStore {
    closed: Vec<Candle>,
    forming: Option<Candle>,
}

impl SeriesStore {
    pub fn closed_bars(&self) -> &[Candle] {
        &self.closed
    }

    pub fn forming_bar(&self) -> Option<&Candle> {
        self.forming.as_ref()
    }

    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.forming.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.closed.clear();
        self.forming = None;
    }

    fn last_closed_time(&self) -> Option<i64> {
        self.closed.last().map(|candle| candle.time)
    }

    /// Replaces all state with a validated snapshot, or leaves it untouched.
    pub fn load_snapshot(&mut self, candles: Vec<Candle>) -> Result<(), AppError> {
        validate_snapshot(&candles)?;
        self.closed = candles;
        self.forming = None;
        Ok(())
    }

    pub fn apply_bucket_updated(&mut self, bucket: &Candle) -> UpsertOutcome {
        let accepted = match (&self.forming, self.last_closed_time()) {
            (Some(forming), _) => bucket.time == forming.time,
            (None, Some(last_time)) => bucket.time > last_time,
            (None, None) => true,
        };

        if !accepted {
            return UpsertOutcome::Ignored;
        }

        self.forming = Some(bucket.clone());
        UpsertOutcome::Applied
    }

    pub fn apply_bucket_closed(&mut self, bucket: &Candle) -> CloseOutcome {
        if let Some(last_time) = self.last_closed_time() {
            if bucket.time == last_time {
                return CloseOutcome::Duplicate;
            }
            if bucket.time < last_time {
                return CloseOutcome::OrderingAnomaly { last_time };
            }
        }

        let mut outcome = CloseOutcome::Appended;
        if let Some(forming_time) = self.forming.as_ref().map(|forming| forming.time) {
            if forming_time < bucket.time {
                outcome = CloseOutcome::AppendedPastForming { forming_time };
                self.forming = None;
            } else if forming_time == bucket.time {
                self.forming = None;
            }
        }

        self.closed.push(bucket.clone());
        outcome
    }

    pub fn current_view(&self) -> Vec<Candle> {
        let mut view = Vec::with_capacity(self.len());
        view.extend_from_slice(&self.closed);
        if let Some(forming) = &self.forming {
            view.push(forming.clone());
        }
        view
    }
}

fn validate_snapshot(candles: &[Candle]) -> Result<(), AppError> {
    for candle in candles {
        candle.validate()?;
    }

    if let Some(pair) = candles.windows(2).find(|pair| pair[1].time <= pair[0].time) {
        return Err(AppError::InvalidSnapshot(format!(
            "candle times must be strictly increasing ({} followed by {})",
            pair[0].time, pair[1].time
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    fn is_strictly_increasing(view: &[Candle]) -> bool {
        view.windows(2).all(|pair| pair[0].time < pair[1].time)
    }

    #[test]
    fn loads_valid_snapshot_and_clears_forming() {
        let mut store = SeriesStore::default();
        let _ = store.apply_bucket_updated(&candle(600, 10.0));

        store
            .load_snapshot(vec![candle(60, 1.0), candle(120, 2.0), candle(240, 3.0)])
            .expect("snapshot should load");

        assert_eq!(store.closed_bars().len(), 3);
        assert!(store.forming_bar().is_none());
    }

    #[test]
    fn rejects_decreasing_snapshot_and_keeps_prior_state() {
        let mut store = SeriesStore::default();
        store
            .load_snapshot(vec![candle(0, 1.0)])
            .expect("snapshot should load");
        let _ = store.apply_bucket_updated(&candle(60, 2.0));
        let before = store.clone();

        let result = store.load_snapshot(vec![candle(120, 1.0), candle(60, 2.0)]);

        assert!(matches!(result, Err(AppError::InvalidSnapshot(_))));
        assert_eq!(store, before);
    }

    #[test]
    fn rejects_snapshot_with_duplicates_or_bad_fields() {
        let mut store = SeriesStore::default();

        let duplicate = store.load_snapshot(vec![candle(60, 1.0), candle(60, 1.0)]);
        assert!(matches!(duplicate, Err(AppError::InvalidSnapshot(_))));

        let mut inverted = candle(60, 5.0);
        inverted.high = 4.0;
        assert!(store.load_snapshot(vec![inverted]).is_err());

        let mut non_finite = candle(60, 5.0);
        non_finite.volume = f64::NAN;
        assert!(store.load_snapshot(vec![non_finite]).is_err());

        assert!(store.is_empty());
    }

    #[test]
    fn updated_bucket_replaces_forming_bar() {
        let mut store = SeriesStore::default();
        assert_eq!(
            store.apply_bucket_updated(&candle(60, 1.0)),
            UpsertOutcome::Applied
        );
        assert_eq!(
            store.apply_bucket_updated(&candle(60, 3.0)),
            UpsertOutcome::Applied
        );

        assert_eq!(store.forming_bar().map(|bar| bar.close), Some(3.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn updated_bucket_is_idempotent() {
        let mut store = SeriesStore::default();
        let bucket = candle(60, 1.0);
        let _ = store.apply_bucket_updated(&bucket);
        let once = store.clone();
        let _ = store.apply_bucket_updated(&bucket);

        assert_eq!(store, once);
    }

    #[test]
    fn updated_bucket_behind_snapshot_is_ignored() {
        let mut store = SeriesStore::default();
        store
            .load_snapshot(vec![candle(60, 1.0), candle(120, 2.0)])
            .expect("snapshot should load");

        assert_eq!(
            store.apply_bucket_updated(&candle(120, 9.0)),
            UpsertOutcome::Ignored
        );
        assert_eq!(
            store.apply_bucket_updated(&candle(60, 9.0)),
            UpsertOutcome::Ignored
        );
        assert_eq!(store.current_view().last().map(|bar| bar.close), Some(2.0));
    }

    #[test]
    fn updated_bucket_for_other_time_does_not_replace_forming() {
        let mut store = SeriesStore::default();
        let _ = store.apply_bucket_updated(&candle(120, 1.0));

        assert_eq!(
            store.apply_bucket_updated(&candle(180, 2.0)),
            UpsertOutcome::Ignored
        );
        assert_eq!(store.forming_bar().map(|bar| bar.time), Some(120));
    }

    #[test]
    fn closed_bucket_appends_and_releases_forming() {
        let mut store = SeriesStore::default();
        let _ = store.apply_bucket_updated(&candle(0, 1.0));

        assert_eq!(
            store.apply_bucket_closed(&candle(0, 1.5)),
            CloseOutcome::Appended
        );
        assert!(store.forming_bar().is_none());
        assert_eq!(
            store.apply_bucket_updated(&candle(60, 2.0)),
            UpsertOutcome::Applied
        );

        let view = store.current_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].close, 1.5);
        assert!(is_strictly_increasing(&view));
    }

    #[test]
    fn closed_bucket_past_forming_reports_discarded_bar() {
        let mut store = SeriesStore::default();
        let _ = store.apply_bucket_updated(&candle(60, 1.0));

        assert_eq!(
            store.apply_bucket_closed(&candle(120, 2.0)),
            CloseOutcome::AppendedPastForming { forming_time: 60 }
        );
        assert!(store.forming_bar().is_none());
        let times: Vec<i64> = store.current_view().iter().map(|bar| bar.time).collect();
        assert_eq!(times, vec![120]);
    }

    #[test]
    fn closed_bucket_is_idempotent() {
        let mut store = SeriesStore::default();
        let bucket = candle(60, 1.0);
        let _ = store.apply_bucket_closed(&bucket);
        let once = store.clone();

        assert_eq!(store.apply_bucket_closed(&bucket), CloseOutcome::Duplicate);
        assert_eq!(store, once);
    }

    #[test]
    fn closed_bucket_behind_series_is_an_anomaly() {
        let mut store = SeriesStore::default();
        store
            .load_snapshot(vec![candle(60, 1.0), candle(120, 2.0)])
            .expect("snapshot should load");
        let before = store.clone();

        assert_eq!(
            store.apply_bucket_closed(&candle(60, 5.0)),
            CloseOutcome::OrderingAnomaly { last_time: 120 }
        );
        assert_eq!(store, before);
    }

    #[test]
    fn view_lists_closed_then_forming() {
        let mut store = SeriesStore::default();
        store
            .load_snapshot(vec![candle(0, 1.0), candle(60, 2.0)])
            .expect("snapshot should load");
        let _ = store.apply_bucket_updated(&candle(180, 3.0));

        let times: Vec<i64> = store.current_view().iter().map(|bar| bar.time).collect();
        assert_eq!(times, vec![0, 60, 180]);
    }
}
