use crate::error::AppError;
use crate::market::bitmex::BitmexHistory;
use crate::market::controller::{HistoricalSource, RenderSink};
use crate::market::pipeline::{run_chart_stream, ChartCommand};
use crate::market::types::{
    BinSize, ChartConfig, ChartSession, ChartSessionStopResult, ChartStatusSnapshot,
    StartChartArgs,
};
use crate::state::{AppState, ChartSessionHandle};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const HISTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Starts a BitMEX-backed chart session, replacing any session already running.
pub async fn start_chart_session<K>(
    state: &AppState,
    sink: K,
    args: Option<StartChartArgs>,
) -> Result<ChartSession, AppError>
where
    K: RenderSink + Send + 'static,
{
    let config = args.unwrap_or_default().normalize()?;
    let client = Client::builder().timeout(HISTORY_REQUEST_TIMEOUT).build()?;
    let source = BitmexHistory::new(client, &config);
    start_chart_session_with_source(state, config, source, sink).await
}

pub async fn start_chart_session_with_source<S, K>(
    state: &AppState,
    config: ChartConfig,
    source: S,
    sink: K,
) -> Result<ChartSession, AppError>
where
    S: HistoricalSource + Clone + Send + Sync + 'static,
    K: RenderSink + Send + 'static,
{
    let existing_handle = {
        let mut session_slot = state.chart_session.lock().await;
        session_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status_store = Arc::clone(&state.chart_status);
    let runtime_config = config.clone();
    let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let join_handle = tokio::spawn(async move {
        run_chart_stream(
            runtime_config,
            source,
            sink,
            status_store,
            command_rx,
            task_token,
        )
        .await;
    });

    {
        let mut session_slot = state.chart_session.lock().await;
        *session_slot = Some(ChartSessionHandle {
            cancellation_token,
            join_handle,
            commands,
        });
    }

    Ok(ChartSession::from_config(&config))
}

pub async fn switch_timeframe(state: &AppState, bin_size: &str) -> Result<BinSize, AppError> {
    let bin_size = BinSize::parse(bin_size)?;
    send_command(state, ChartCommand::SwitchTimeframe(bin_size.clone())).await?;
    Ok(bin_size)
}

pub async fn retry_history(state: &AppState) -> Result<(), AppError> {
    send_command(state, ChartCommand::Retry).await
}

pub fn chart_status(state: &AppState) -> ChartStatusSnapshot {
    state.chart_status.read().clone()
}

pub async fn stop_chart_session(state: &AppState) -> Result<ChartSessionStopResult, AppError> {
    let existing_handle = {
        let mut session_slot = state.chart_session.lock().await;
        session_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    Ok(ChartSessionStopResult { stopped })
}

async fn send_command(state: &AppState, command: ChartCommand) -> Result<(), AppError> {
    let commands = {
        let session_slot = state.chart_session.lock().await;
        session_slot
            .as_ref()
            .map(|handle| handle.commands.clone())
            .ok_or(AppError::SessionNotRunning)?
    };

    commands
        .send(command)
        .await
        .map_err(|_| AppError::SessionNotRunning)
}
