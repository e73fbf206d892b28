use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use demos::cli::DepthCacheDemoArgs;
use demos::output::print_side;
use depthcache::{BinanceRestClient, BinanceStreamMultiplexer, DepthCacheConfig, DepthCacheManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = DepthCacheDemoArgs::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls ring provider installs exactly once");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let exchange = args.exchange.into();
    let mut config = DepthCacheConfig::new(exchange);
    config.default_refresh_interval = if args.refresh_interval > 0.0 {
        Some(Duration::from_secs_f64(args.refresh_interval))
    } else {
        None
    };

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
            _ = tokio::time::sleep(Duration::from_secs_f64(args.refresh_interval.max(0.1))) => {
                let mut handle = stdout.lock();
                for market in &markets {
                    match manager.get_asks(market, args.limit, args.threshold) {
                        Ok(levels) => {
                            let _ = print_side(market, "asks", &levels, args.json, &mut buf, &mut handle);
                        }
                        Err(err) => tracing::debug!("{market}: asks unavailable ({err})"),
                    }
                    match manager.get_bids(market, args.limit, args.threshold) {
                        Ok(levels) => {
                            let _ = print_side(market, "bids", &levels, args.json, &mut buf, &mut handle);
                        }
                        Err(err) => tracing::debug!("{market}: bids unavailable ({err})"),
                    }
                }
            }
        }
    }

    manager.stop_manager();
    Ok(())
}
