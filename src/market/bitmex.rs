use crate::error::AppError;
use crate::market::controller::HistoricalSource;
use crate::market::types::{BinSize, BucketedWire, Candle, ChartConfig};
use reqwest::Client;
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub type BitmexWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn bucketed_endpoint(rest_base_url: &str, symbol: &str, bin_size: &BinSize, count: u16) -> String {
    format!(
        "{}/trade/bucketed?binSize={}&symbol={}&count={count}&reverse=true",
        rest_base_url.trim_end_matches('/'),
        bin_size.as_str(),
        symbol.to_ascii_uppercase()
    )
}

pub async fn connect_trade_stream(ws_url: &str) -> Result<BitmexWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_bucketed_history(
    client: &Client,
    rest_base_url: &str,
    symbol: &str,
    bin_size: &BinSize,
    count: u16,
) -> Result<Vec<Candle>, AppError> {
    let endpoint = bucketed_endpoint(rest_base_url, symbol, bin_size, count);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let mut body = response.bytes().await?.to_vec();
    let payload: Vec<BucketedWire> = simd_json::serde::from_slice(body.as_mut_slice())
        .map_err(|error| AppError::InvalidPayload(error.to_string()))?;

    let candles = merge_buckets(payload, bin_size.seconds())?;
    if candles.is_empty() {
        return Err(AppError::InvalidPayload(
            "no candles returned for the requested bin size".to_string(),
        ));
    }
    Ok(candles)
}

/// Sorts rows ascending and folds rows sharing a timestamp into one bar.
fn merge_buckets(rows: Vec<BucketedWire>, bin_seconds: i64) -> Result<Vec<Candle>, AppError> {
    let mut candles = Vec::with_capacity(rows.len());
    let mut skipped = 0_usize;
    for row in rows {
        match row.into_candle(bin_seconds)? {
            Some(candle) => candles.push(candle),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "skipped buckets without trades");
    }

    candles.sort_by_key(|candle| candle.time);

    let mut merged: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match merged.last_mut() {
            Some(last) if last.time == candle.time => {
                last.high = last.high.max(candle.high);
                last.low = last.low.min(candle.low);
                last.close = candle.close;
                last.volume += candle.volume;
            }
            _ => merged.push(candle),
        }
    }

    Ok(merged)
}

#[derive(Debug, Clone)]
pub struct BitmexHistory {
    client: Client,
    rest_base_url: String,
    symbol: String,
    count: u16,
}

impl BitmexHistory {
    pub fn new(client: Client, config: &ChartConfig) -> Self {
        Self {
            client,
            rest_base_url: config.rest_base_url.clone(),
            symbol: config.symbol.clone(),
            count: config.history_count,
        }
    }
}

impl HistoricalSource for BitmexHistory {
    fn fetch_candles(
        &self,
        bin_size: &BinSize,
    ) -> impl Future<Output = Result<Vec<Candle>, AppError>> + Send {
        let source = self.clone();
        let bin_size = bin_size.clone();
        async move {
            fetch_bucketed_history(
                &source.client,
                &source.rest_base_url,
                &source.symbol,
                &bin_size,
                source.count,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(timestamp: &str, open: f64, high: f64, low: f64, close: f64, volume: f64) -> BucketedWire {
        BucketedWire {
            timestamp: timestamp.to_string(),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: Some(volume),
        }
    }

    #[test]
    fn bucketed_endpoint_uses_bin_size_and_count() {
        let bin_size = BinSize::parse("5m").expect("5m is valid");
        let endpoint =
            bucketed_endpoint("https://testnet.bitmex.com/api/v1/", "xbtusd", &bin_size, 300);

        assert!(endpoint.starts_with("https://testnet.bitmex.com/api/v1/trade/bucketed?"));
        assert!(endpoint.contains("binSize=5m"));
        assert!(endpoint.contains("symbol=XBTUSD"));
        assert!(endpoint.contains("count=300"));
        assert!(endpoint.contains("reverse=true"));
    }

    #[test]
    fn merges_newest_first_rows_into_ascending_series() {
        let rows = vec![
            row("2024-01-01T00:03:00.000Z", 103.0, 104.0, 102.0, 103.5, 3.0),
            row("2024-01-01T00:02:00.000Z", 101.0, 103.0, 100.0, 102.0, 2.0),
            row("2024-01-01T00:01:00.000Z", 100.0, 101.0, 99.0, 100.5, 1.0),
        ];

        let candles = merge_buckets(rows, 60).expect("rows should merge");
        let times: Vec<i64> = candles.iter().map(|candle| candle.time).collect();

        assert_eq!(times, vec![1_704_067_200, 1_704_067_260, 1_704_067_320]);
    }

    #[test]
    fn folds_rows_sharing_a_timestamp() {
        let rows = vec![
            row("2024-01-01T00:01:00.000Z", 100.0, 101.0, 99.0, 100.5, 1.0),
            row("2024-01-01T00:01:00.000Z", 100.5, 106.0, 100.0, 104.0, 2.5),
        ];

        let candles = merge_buckets(rows, 60).expect("rows should merge");

        assert_eq!(candles.len(), 1);
        let merged = &candles[0];
        assert_eq!(merged.open, 100.0);
        assert_eq!(merged.high, 106.0);
        assert_eq!(merged.low, 99.0);
        assert_eq!(merged.close, 104.0);
        assert!((merged.volume - 3.5).abs() < 1e-9);
    }

    #[test]
    fn skips_rows_without_trades() {
        let mut empty = row("2024-01-01T00:02:00.000Z", 0.0, 0.0, 0.0, 0.0, 0.0);
        empty.open = None;
        empty.close = None;
        let rows = vec![row("2024-01-01T00:01:00.000Z", 1.0, 1.0, 1.0, 1.0, 1.0), empty];

        let candles = merge_buckets(rows, 60).expect("rows should merge");
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn rejects_rows_with_bad_timestamps() {
        let rows = vec![row("yesterday", 1.0, 1.0, 1.0, 1.0, 1.0)];
        assert!(merge_buckets(rows, 60).is_err());
    }
}
