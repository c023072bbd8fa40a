use crate::error::AppError;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SYMBOL: &str = "XBTUSD";
pub const DEFAULT_BIN_SIZE: &str = "1m";
pub const DEFAULT_HISTORY_COUNT: u16 = 1_000;
pub const MIN_HISTORY_COUNT: u16 = 1;
pub const MAX_HISTORY_COUNT: u16 = 1_000;
pub const DEFAULT_REST_BASE_URL: &str = "https://testnet.bitmex.com/api/v1";
pub const DEFAULT_WS_URL: &str = "wss://ws-testnet.bitmex.com/realtime";
pub const TRADE_TABLE: &str = "trade";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Idle,
    Loading,
    LoadFailed,
    Live,
    Reconnecting,
    Stopped,
}

impl FeedState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::LoadFailed => "load_failed",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

/// Fixed-duration bar width such as `1m`, `5m`, `1h` or `1d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BinSize {
    label: String,
    seconds: i64,
}

impl BinSize {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let label = raw.trim();
        if label.len() < 2 || !label.is_ascii() {
            return Err(AppError::InvalidArgument(format!(
                "invalid bin size '{raw}': expected format like '1m'"
            )));
        }

        let (quantity, unit) = label.split_at(label.len() - 1);
        let quantity = quantity.parse::<i64>().map_err(|_| {
            AppError::InvalidArgument(format!(
                "invalid bin size '{raw}': quantity must be a positive integer"
            ))
        })?;
        if quantity <= 0 {
            return Err(AppError::InvalidArgument(format!(
                "invalid bin size '{raw}': quantity must be > 0"
            )));
        }

        let unit_seconds = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 7 * 86_400,
            _ => {
                return Err(AppError::InvalidArgument(format!(
                    "invalid bin size '{raw}': unsupported unit '{unit}', expected one of s/m/h/d/w"
                )))
            }
        };

        let seconds = quantity.checked_mul(unit_seconds).ok_or_else(|| {
            AppError::InvalidArgument(format!("invalid bin size '{raw}': value is too large"))
        })?;

        Ok(Self {
            label: label.to_string(),
            seconds,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.label
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }
}

impl Default for BinSize {
    fn default() -> Self {
        Self {
            label: DEFAULT_BIN_SIZE.to_string(),
            seconds: 60,
        }
    }
}

impl fmt::Display for BinSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl TryFrom<String> for BinSize {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BinSize> for String {
    fn from(value: BinSize) -> Self {
        value.label
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartStatusSnapshot {
    pub state: FeedState,
    pub symbol: String,
    pub bin_size: BinSize,
    pub generation: u64,
    pub candle_count: usize,
    pub forming_time: Option<i64>,
    pub reason: Option<String>,
}

impl ChartStatusSnapshot {
    pub fn idle(symbol: String, bin_size: BinSize, reason: Option<String>) -> Self {
        Self {
            state: FeedState::Idle,
            symbol,
            bin_size,
            generation: 0,
            candle_count: 0,
            forming_time: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChartArgs {
    pub symbol: Option<String>,
    pub bin_size: Option<String>,
    pub history_count: Option<u16>,
    pub rest_base_url: Option<String>,
    pub ws_url: Option<String>,
}

impl StartChartArgs {
    /// Reads `CHART_SYMBOL`, `CHART_BIN_SIZE`, `CHART_HISTORY_COUNT`,
    /// `BITMEX_REST_URL` and `BITMEX_WS_URL`. Blank values count as unset.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let history_count = match resolve("CHART_HISTORY_COUNT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
                AppError::InvalidArgument(format!("CHART_HISTORY_COUNT is not a valid count: {raw}"))
            })?),
            None => None,
        };

        Ok(Self {
            symbol: resolve("CHART_SYMBOL"),
            bin_size: resolve("CHART_BIN_SIZE"),
            history_count,
            rest_base_url: resolve("BITMEX_REST_URL"),
            ws_url: resolve("BITMEX_WS_URL"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChartConfig {
    pub symbol: String,
    pub bin_size: BinSize,
    pub history_count: u16,
    pub rest_base_url: String,
    pub ws_url: String,
}

impl StartChartArgs {
    pub fn normalize(self) -> Result<ChartConfig, AppError> {
        let symbol = self
            .symbol
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string())
            .trim()
            .to_ascii_uppercase();

        if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "symbol must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let bin_size = match self.bin_size {
            Some(raw) => BinSize::parse(&raw)?,
            None => BinSize::default(),
        };

        let history_count = self.history_count.unwrap_or(DEFAULT_HISTORY_COUNT);
        if !(MIN_HISTORY_COUNT..=MAX_HISTORY_COUNT).contains(&history_count) {
            return Err(AppError::InvalidArgument(format!(
                "historyCount must be between {MIN_HISTORY_COUNT} and {MAX_HISTORY_COUNT}"
            )));
        }

        let rest_base_url = self
            .rest_base_url
            .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(rest_base_url.starts_with("http://") || rest_base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "restBaseUrl must start with http:// or https://".to_string(),
            ));
        }

        let ws_url = self
            .ws_url
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string())
            .trim()
            .to_string();
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "wsUrl must start with ws:// or wss://".to_string(),
            ));
        }

        Ok(ChartConfig {
            symbol,
            bin_size,
            history_count,
            rest_base_url,
            ws_url,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSession {
    pub running: bool,
    pub symbol: String,
    pub bin_size: BinSize,
    pub history_count: u16,
    pub rest_base_url: String,
    pub ws_url: String,
}

impl ChartSession {
    pub fn from_config(config: &ChartConfig) -> Self {
        Self {
            running: true,
            symbol: config.symbol.clone(),
            bin_size: config.bin_size.clone(),
            history_count: config.history_count,
            rest_base_url: config.rest_base_url.clone(),
            ws_url: config.ws_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSessionStopResult {
    pub stopped: bool,
}

/// One OHLCV bar keyed by its open boundary in Unix seconds.
///
/// The same shape serves as the forming bucket inside the aggregator, a
/// closed bar in the series, and the record handed to the render sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn create(bucket_time: i64, price: f64, size: f64) -> Self {
        Self {
            time: bucket_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        }
    }

    /// Folds one trade into the bar. `time` and `open` never move.
    pub fn absorb(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(AppError::InvalidSnapshot(format!(
                "candle {} has non-finite or negative fields",
                self.time
            )));
        }

        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(AppError::InvalidSnapshot(format!(
                "candle {} violates low <= open,close <= high",
                self.time
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: f64,
}

impl TradeEvent {
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(AppError::InvalidTrade(format!(
                "price must be a finite positive number, got {}",
                self.price
            )));
        }
        if !self.size.is_finite() || self.size < 0.0 {
            return Err(AppError::InvalidTrade(format!(
                "size must be a finite non-negative number, got {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// Scalar as it appears on the wire: BitMEX sends numbers, some relays send
/// numeric strings, and anything else must not fail the whole frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireScalar {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

impl WireScalar {
    fn as_f64(&self, field: &str) -> Result<f64, AppError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(text) => Ok(text.trim().parse::<f64>()?),
            Self::Other(_) => Err(AppError::InvalidTrade(format!(
                "{field} must be numeric"
            ))),
        }
    }

    fn as_timestamp_ms(&self) -> Result<i64, AppError> {
        match self {
            Self::Number(value) if value.is_finite() => Ok(value.trunc() as i64),
            Self::Number(_) => Err(AppError::InvalidTrade(
                "timestamp must be finite".to_string(),
            )),
            Self::Text(text) => Ok(chrono::DateTime::parse_from_rfc3339(text.trim())?
                .timestamp_millis()),
            Self::Other(_) => Err(AppError::InvalidTrade(
                "timestamp must be a string or number".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TradeWire {
    #[serde(default)]
    pub timestamp: Option<WireScalar>,
    #[serde(default)]
    pub price: Option<WireScalar>,
    #[serde(default)]
    pub size: Option<WireScalar>,
    #[serde(default, rename = "trdMatchID")]
    pub trd_match_id: Option<String>,
}

impl TryFrom<TradeWire> for TradeEvent {
    type Error = AppError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        let timestamp_ms = value
            .timestamp
            .ok_or_else(|| AppError::InvalidTrade("missing timestamp".to_string()))?
            .as_timestamp_ms()
            .map_err(|error| AppError::InvalidTrade(error.to_string()))?;
        let price = value
            .price
            .ok_or_else(|| AppError::InvalidTrade("missing price".to_string()))?
            .as_f64("price")
            .map_err(|error| AppError::InvalidTrade(error.to_string()))?;
        let size = value
            .size
            .ok_or_else(|| AppError::InvalidTrade("missing size".to_string()))?
            .as_f64("size")
            .map_err(|error| AppError::InvalidTrade(error.to_string()))?;

        Ok(Self {
            timestamp_ms,
            price,
            size,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedMessageWire {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<TradeWire>>,
}

impl FeedMessageWire {
    /// `partial` frames answer a subscribe with a replay of recent trades.
    pub fn is_partial(&self) -> bool {
        self.action.as_deref() == Some("partial")
    }

    /// Trade rows of a `trade` table frame; `None` for every other frame.
    pub fn into_trades(self) -> Option<Vec<TradeWire>> {
        if self.table.as_deref() != Some(TRADE_TABLE) {
            return None;
        }
        self.data
    }
}

pub fn parse_feed_message(payload: &mut [u8]) -> Result<FeedMessageWire, AppError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

#[derive(Debug, Serialize)]
struct SubscribeRequestWire<'a> {
    op: &'a str,
    args: Vec<String>,
}

pub fn subscribe_payload(symbol: &str) -> Result<String, AppError> {
    let request = SubscribeRequestWire {
        op: "subscribe",
        args: vec![format!("{TRADE_TABLE}:{symbol}")],
    };
    Ok(simd_json::to_string(&request)?)
}

#[derive(Debug, Deserialize)]
pub struct BucketedWire {
    pub timestamp: String,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl BucketedWire {
    /// BitMEX stamps a bucket with its close time; the returned candle is keyed
    /// by the open boundary instead. Buckets without trades yield `None`.
    pub fn into_candle(self, bin_seconds: i64) -> Result<Option<Candle>, AppError> {
        let (Some(open), Some(high), Some(low), Some(close)) =
            (self.open, self.high, self.low, self.close)
        else {
            return Ok(None);
        };

        let close_time = chrono::DateTime::parse_from_rfc3339(&self.timestamp)?.timestamp();
        let volume = self.volume.unwrap_or(0.0);
        if ![open, high, low, close, volume]
            .iter()
            .all(|value| value.is_finite())
        {
            return Err(AppError::InvalidPayload(
                "bucketed values must be finite".to_string(),
            ));
        }

        let open_time = close_time.checked_sub(bin_seconds).ok_or_else(|| {
            AppError::InvalidPayload(format!(
                "bucket {} cannot be shifted back by {bin_seconds}s",
                self.timestamp
            ))
        })?;

        Ok(Some(Candle {
            time: open_time,
            open,
            high,
            low,
            close,
            volume: volume.max(0.0),
        }))
    }
}
