use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use demos::cli::MultiMarketsArgs;
use demos::output::print_summary;
use depthcache::{BinanceRestClient, BinanceStreamMultiplexer, DepthCacheConfig, DepthCacheManager};

/// Track many markets at once and print a `print_summary`-style table of
/// per-market synchronization state and book depth.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = MultiMarketsArgs::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls ring provider installs exactly once");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let exchange = args.exchange.into();
    let config = DepthCacheConfig::new(exchange);

    let snapshot_source = Arc::new(BinanceRestClient::new(config.rest_base_url().to_string(), exchange));
    let multiplexer = BinanceStreamMultiplexer::new(
        config.ws_base_url().to_string(),
        config.max_stream_capacity,
        config.depth_cache_update_interval_ms,
        config.websocket_ping_interval,
        config.websocket_ping_timeout,
        config.websocket_close_timeout,
    );

    let manager = DepthCacheManager::new(config, snapshot_source, multiplexer);

    let markets: Vec<&str> = args.markets.iter().map(String::as_str).collect();
    manager.create_depthcache(&markets, None);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let mut buf = String::new();
    let stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs_f64(args.summary_interval.max(0.1))) => {
                let rows: Vec<(String, bool, usize, usize)> = markets
                    .iter()
                    .map(|market| {
                        let synchronized = manager.is_depth_cache_synchronized(market);
                        let ask_count = manager.get_asks(market, None, None).map(|v| v.len()).unwrap_or(0);
                        let bid_count = manager.get_bids(market, None, None).map(|v| v.len()).unwrap_or(0);
                        (market.to_string(), synchronized, ask_count, bid_count)
                    })
                    .collect();

                let mut handle = stdout.lock();
                let _ = print_summary(&rows, &mut buf, &mut handle);
            }
        }
    }

    manager.stop_manager();
    Ok(())
}
