use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Table};
use et_core::configuration::EngineConfig;
use et_core::coordinator::CalculationCoordinator;
use et_core::esi_client::EsiClient;
use et_core::market_cache::{InMemoryCacheStore, MarketCache, StalenessPolicy};
use et_core::topology::StaticTopology;
use et_domain::{ActorModifiers, CalculationScope, RankMetric, RegionId, TypeId};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thousands::Separable;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Rank profitable trade routes for a region from live market data.
#[derive(Parser, Debug)]
#[command(name = "routes")]
struct Cli {
    /// Region to scan
    #[arg(long)]
    region_id: i32,

    /// Item type ids, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    type_ids: Vec<i32>,

    /// Reference data file (item volumes, station travel times)
    #[arg(long)]
    topology: PathBuf,

    /// Cargo capacity of the hauler in m3
    #[arg(long, default_value_t = 5_000.0)]
    cargo_m3: f64,

    /// Fitting bonus applied to the cargo hold
    #[arg(long, default_value_t = 1.0)]
    cargo_bonus: f64,

    #[arg(long, default_value_t = 0)]
    navigation_level: u8,

    #[arg(long, default_value_t = 0)]
    accounting_level: u8,

    #[arg(long, default_value_t = 0)]
    broker_relations_level: u8,

    /// Cap on the ISK committed to the buy side
    #[arg(long)]
    investment_ceiling: Option<f64>,

    /// Rank by net profit instead of ISK/hour
    #[arg(long)]
    rank_by_profit: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Show at most this many candidates
    #[arg(long, default_value_t = 25)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_span_events(fmt::format::FmtSpan::CLOSE))
        .with(EnvFilter::from_default_env())
        .init();

    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let config = EngineConfig::from_env().context("Failed to read engine configuration")?;

    let topology_raw = std::fs::read_to_string(&cli.topology)
        .with_context(|| format!("Failed to read topology file {}", cli.topology.display()))?;
    let topology = Arc::new(StaticTopology::from_json(&topology_raw)?);

    let cache = Arc::new(MarketCache::new(
        Arc::new(InMemoryCacheStore::new()),
        StalenessPolicy {
            fresh_max_age: config.fresh_max_age(),
            stale_max_age: config.stale_max_age(),
        },
        config.cache_ttl(),
    ));
    let gateway = Arc::new(EsiClient::from_config(&config));

    let scope = CalculationScope {
        region_id: RegionId(cli.region_id),
        type_ids: cli.type_ids.iter().copied().map(TypeId).collect(),
        investment_ceiling: cli.investment_ceiling,
        rank_metric: if cli.rank_by_profit {
            RankMetric::NetProfit
        } else {
            RankMetric::IskPerHour
        },
    };
    let modifiers = ActorModifiers {
        cargo_capacity_m3: cli.cargo_m3,
        cargo_bonus_multiplier: cli.cargo_bonus,
        navigation_level: cli.navigation_level,
        accounting_level: cli.accounting_level,
        broker_relations_level: cli.broker_relations_level,
    };

    let requested = scope.type_ids.len();
    let coordinator = CalculationCoordinator::new(gateway, cache, topology, config);
    let result = coordinator.calculate(scope, modifiers).await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Item", "Buy @", "Sell @", "Qty", "Spread %", "Net Profit", "ISK/h", "Travel"]);
    for candidate in result.candidates.iter().take(cli.limit) {
        table.add_row(vec![
            Cell::new(&candidate.type_name),
            Cell::new(candidate.buy_location.0),
            Cell::new(candidate.sell_location.0),
            Cell::new(candidate.quantity),
            Cell::new(format!("{:.1}", candidate.spread_percent)),
            Cell::new(format!("{} ISK", (candidate.net_profit.round() as i64).separate_with_commas())),
            Cell::new(format!("{} ISK", (candidate.isk_per_hour.round() as i64).separate_with_commas())),
            Cell::new(format!("{}s", candidate.travel_time.as_secs())),
        ]);
    }
    println!("{table}");
    println!(
        "completeness: {} ({} of {} order books missing)",
        result.completeness,
        result.missing_keys.len(),
        requested
    );

    Ok(())
}
