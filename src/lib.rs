pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use commands::chart_session::{start_chart_session, stop_chart_session};
use error::AppError;
use market::controller::RenderSink;
use market::types::{Candle, ChartStatusSnapshot, StartChartArgs};
use state::AppState;
use tracing::{debug, info};

/// Render sink that reports series changes through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl RenderSink for TracingSink {
    fn replace_all(&mut self, candles: &[Candle]) {
        info!(
            candles = candles.len(),
            first = candles.first().map(|candle| candle.time),
            last = candles.last().map(|candle| candle.time),
            "series replaced"
        );
    }

    fn upsert(&mut self, candle: &Candle) {
        debug!(
            time = candle.time,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            "candle upserted"
        );
    }

    fn status_changed(&mut self, status: &ChartStatusSnapshot) {
        info!(
            state = status.state.as_str(),
            symbol = %status.symbol,
            bin_size = %status.bin_size,
            generation = status.generation,
            candles = status.candle_count,
            reason = status.reason.as_deref().unwrap_or(""),
            "chart status"
        );
    }
}

/// Runs one chart session until Ctrl-C.
pub async fn run(args: StartChartArgs) -> Result<(), AppError> {
    let state = AppState::new();
    let session = start_chart_session(&state, TracingSink, Some(args)).await?;
    info!(
        symbol = %session.symbol,
        bin_size = %session.bin_size,
        history_count = session.history_count,
        rest_base_url = %session.rest_base_url,
        ws_url = %session.ws_url,
        "chart session started"
    );

    if let Err(error) = tokio::signal::ctrl_c().await {
        debug!(error = %error, "ctrl-c listener failed, stopping session");
    }

    let stop = stop_chart_session(&state).await?;
    info!(stopped = stop.stopped, "chart session shut down");
    Ok(())
}
