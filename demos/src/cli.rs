use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ExchangeArg {
    Spot,
    LinearFutures,
}

impl From<ExchangeArg> for depthcache::ExchangeFlavor {
    fn from(value: ExchangeArg) -> Self {
        match value {
            ExchangeArg::Spot => depthcache::ExchangeFlavor::Spot,
            ExchangeArg::LinearFutures => depthcache::ExchangeFlavor::LinearFutures,
        }
    }
}

/// Stream a live order-book depth cache for one or more markets, printing a
/// periodic top-N snapshot of both sides.
#[derive(Parser, Debug)]
#[command(name = "depthcache-demo", version)]
pub struct DepthCacheDemoArgs {
    /// Market symbols (e.g. btcusdt ethusdt)
    #[arg(required = true)]
    pub markets: Vec<String>,

    /// Output as JSON instead of TSV
    #[arg(long)]
    pub json: bool,

    /// Number of price levels to print per side (folds in the original's
    /// `example_limit_count.py`)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Cumulative price*qty volume cutoff per side (folds in the
    /// original's `example_threshold_volume.py`)
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Print interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub refresh_interval: f64,

    /// Exchange flavor
    #[arg(long, value_enum, default_value_t = ExchangeArg::Spot)]
    pub exchange: ExchangeArg,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Track many markets at once and print a `print_summary`-style table of
/// per-market synchronization state.
#[derive(Parser, Debug)]
#[command(name = "depthcache-multi-markets", version)]
pub struct MultiMarketsArgs {
    /// Market symbols
    #[arg(required = true)]
    pub markets: Vec<String>,

    /// Exchange flavor
    #[arg(long, value_enum, default_value_t = ExchangeArg::Spot)]
    pub exchange: ExchangeArg,

    /// Summary print interval in seconds
    #[arg(long, default_value_t = 2.0)]
    pub summary_interval: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
