use live_candles_lib::market::types::StartChartArgs;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let result = match StartChartArgs::from_env() {
        Ok(args) => live_candles_lib::run(args).await,
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        error!(error = %error, "live-candles exited with error");
        std::process::exit(1);
    }
}
