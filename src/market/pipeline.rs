use crate::error::AppError;
use crate::market::bitmex::{connect_trade_stream, BitmexWsStream};
use crate::market::controller::{
    FeedController, HistoricalSource, LoadOutcome, LoadRequest, MessageOutcome, RenderSink,
};
use crate::market::types::{subscribe_payload, BinSize, Candle, ChartConfig, ChartStatusSnapshot};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FETCH_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartCommand {
    SwitchTimeframe(BinSize),
    Retry,
}

struct FetchCompletion {
    generation: u64,
    result: Result<Vec<Candle>, AppError>,
}

type ConnectHandle = JoinHandle<Result<BitmexWsStream, AppError>>;

/// Drives one chart session until cancelled. Every trigger (fetch
/// completion, feed frame, user command) is handled to completion on this
/// task before the next one is polled.
pub async fn run_chart_stream<S, K>(
    config: ChartConfig,
    source: S,
    sink: K,
    status_store: Arc<RwLock<ChartStatusSnapshot>>,
    mut commands: mpsc::Receiver<ChartCommand>,
    cancel_token: CancellationToken,
) where
    S: HistoricalSource + Clone + Send + Sync + 'static,
    K: RenderSink + Send,
{
    let mut controller = FeedController::new(
        config.symbol.clone(),
        config.bin_size.clone(),
        sink,
        status_store,
    );
    let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchCompletion>(FETCH_CHANNEL_CAPACITY);

    info!(
        symbol = %config.symbol,
        bin_size = %config.bin_size,
        ws_url = %config.ws_url,
        "starting chart stream"
    );
    let request = controller.start();
    spawn_fetch(&source, request, &fetch_tx);

    let mut websocket: Option<BitmexWsStream> = None;
    let mut connecting: Option<ConnectHandle> = Some(spawn_connect(&config.ws_url));
    let mut reconnect_at: Option<Instant> = None;
    let mut reconnect_attempt = 0_u32;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                let request = match command {
                    ChartCommand::SwitchTimeframe(bin_size) => controller.switch_timeframe(bin_size),
                    ChartCommand::Retry => controller.retry(),
                };
                spawn_fetch(&source, request, &fetch_tx);
            }
            Some(completion) = fetch_rx.recv() => {
                let outcome = controller.complete_load(completion.generation, completion.result);
                if let LoadOutcome::Loaded { subscribe: true, .. } = outcome {
                    if let Some(stream) = websocket.as_mut() {
                        if let Err(error) = send_subscribe(stream, controller.symbol()).await {
                            websocket = None;
                            controller.on_feed_closed(&error.to_string());
                            reconnect_attempt = reconnect_attempt.saturating_add(1);
                            reconnect_at = Some(Instant::now() + reconnect_delay(reconnect_attempt));
                        }
                    }
                }
            }
            connected = await_connect(&mut connecting) => {
                connecting = None;
                let connected = connected.unwrap_or_else(|error| {
                    Err(AppError::FeedDisconnected(format!("connect task failed: {error}")))
                });
                match connected {
                    Ok(mut stream) => {
                        info!(symbol = %config.symbol, "live feed connected");
                        let subscribe = controller.on_feed_opened();
                        let subscribed = if subscribe {
                            send_subscribe(&mut stream, controller.symbol()).await
                        } else {
                            Ok(())
                        };
                        match subscribed {
                            Ok(()) => {
                                reconnect_attempt = 0;
                                websocket = Some(stream);
                            }
                            Err(error) => {
                                controller.on_feed_closed(&error.to_string());
                                reconnect_attempt = reconnect_attempt.saturating_add(1);
                                reconnect_at = Some(Instant::now() + reconnect_delay(reconnect_attempt));
                            }
                        }
                    }
                    Err(error) => {
                        controller.on_feed_closed(&format!("websocket connect error: {error}"));
                        reconnect_attempt = reconnect_attempt.saturating_add(1);
                        reconnect_at = Some(Instant::now() + reconnect_delay(reconnect_attempt));
                    }
                }
            }
            frame = next_frame(&mut websocket) => {
                if let Some(reason) = handle_frame(&mut controller, frame) {
                    websocket = None;
                    controller.on_feed_closed(&reason);
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    reconnect_at = Some(Instant::now() + reconnect_delay(reconnect_attempt));
                }
            }
            _ = wait_until(reconnect_at) => {
                reconnect_at = None;
                debug!(attempt = reconnect_attempt, "reconnecting live feed");
                connecting = Some(spawn_connect(&config.ws_url));
            }
        }
    }

    if let Some(handle) = connecting.take() {
        handle.abort();
    }
    if let Some(mut stream) = websocket.take() {
        if let Err(error) = stream.close(None).await {
            debug!(error = %error, "failed to close websocket cleanly");
        }
    }
    controller.stop();
    info!(symbol = %config.symbol, "chart stream stopped");
}

/// Routes one websocket frame; returns the disconnect reason when the feed ended.
fn handle_frame<K: RenderSink>(
    controller: &mut FeedController<K>,
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Option<String> {
    let outcome = match frame {
        Some(Ok(Message::Text(text_payload))) => {
            let mut owned_payload = text_payload.into_bytes();
            controller.on_feed_message(owned_payload.as_mut_slice())
        }
        Some(Ok(Message::Binary(mut binary_payload))) => {
            controller.on_feed_message(binary_payload.as_mut_slice())
        }
        Some(Ok(Message::Close(_))) => return Some("closed by server".to_string()),
        Some(Ok(_)) => return None,
        Some(Err(error)) => return Some(format!("websocket frame error: {error}")),
        None => return Some("websocket stream ended".to_string()),
    };

    log_message_outcome(&outcome);
    None
}

fn log_message_outcome(outcome: &MessageOutcome) {
    debug!(
        applied = outcome.applied,
        rejected = outcome.rejected,
        stale = outcome.stale,
        replayed = outcome.replayed,
        ignored = outcome.ignored,
        "feed frame processed"
    );
}

fn spawn_fetch<S>(source: &S, request: LoadRequest, completions: &mpsc::Sender<FetchCompletion>)
where
    S: HistoricalSource + Clone + Send + Sync + 'static,
{
    let source = source.clone();
    let completions = completions.clone();
    debug!(
        generation = request.generation,
        bin_size = %request.bin_size,
        "spawning historical fetch"
    );
    tokio::spawn(async move {
        let result = source.fetch_candles(&request.bin_size).await;
        let completion = FetchCompletion {
            generation: request.generation,
            result,
        };
        if completions.send(completion).await.is_err() {
            debug!("chart stream ended before historical fetch completed");
        }
    });
}

fn spawn_connect(ws_url: &str) -> ConnectHandle {
    let ws_url = ws_url.to_string();
    tokio::spawn(async move { connect_trade_stream(&ws_url).await })
}

async fn send_subscribe(stream: &mut BitmexWsStream, symbol: &str) -> Result<(), AppError> {
    let payload = subscribe_payload(symbol)?;
    stream.send(Message::Text(payload)).await?;
    info!(symbol = %symbol, "trade subscription sent");
    Ok(())
}

async fn await_connect(
    connecting: &mut Option<ConnectHandle>,
) -> Result<Result<BitmexWsStream, AppError>, JoinError> {
    match connecting.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    websocket: &mut Option<BitmexWsStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match websocket.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    let delay = Duration::from_millis((base_ms + jitter_ms).min(5_000));
    if attempt > 3 {
        warn!(attempt, delay_ms = delay.as_millis() as u64, "live feed still unreachable");
    }
    delay
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
