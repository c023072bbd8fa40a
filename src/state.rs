use crate::market::pipeline::ChartCommand;
use crate::market::types::{BinSize, ChartStatusSnapshot, DEFAULT_SYMBOL};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ChartSessionHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub commands: mpsc::Sender<ChartCommand>,
}

pub struct AppState {
    pub chart_session: Mutex<Option<ChartSessionHandle>>,
    pub chart_status: Arc<RwLock<ChartStatusSnapshot>>,
}

impl AppState {
    pub fn new() -> Self {
        let chart_status = ChartStatusSnapshot::idle(
            DEFAULT_SYMBOL.to_string(),
            BinSize::default(),
            Some("session idle".to_string()),
        );

        Self {
            chart_session: Mutex::new(None),
            chart_status: Arc::new(RwLock::new(chart_status)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
