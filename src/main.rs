//! Sentinel Liquidation Bot
//!
//! Real-time liquidation bot for an Aave V3-style lending pool on Base.
//! Features:
//! - Event-driven watch set over WebSocket subscriptions with backfill
//! - Batched health factor reads via Multicall3 at explicit block tags
//! - Pre-simulated plans, calldata templates, multi-key submission
//! - Private relay with public write racing and a timed gas-bump ladder
//! - Decision traces and miss classification for every competitor call

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_chain::{
    create_gas_strategy, parse_pool_event, EndpointManager, EventIngestor, FallbackMode,
    FeedConfig, GasBurstConfig, GasBurstManager, HealthFactorEngine, HfEngineConfig,
    IngestorConfig, KeySelection, MultiKeyManager, OracleConfig, PoolEvent, PriceOracle,
    PrivateMode, PrivateTxConfig, PrivateTxSender, TipStrategy, WriteRacer,
};
use sentinel_core::wad_math::{usd_to_base, WAD};
use sentinel_core::{
    config::BotConfig, init_config, verify_dump, BudgetConfig, CandidateManager,
    DecisionTraceStore, FallbackConfig, FallbackOrchestrator, HotSetDump, HotSetTracker,
    InFlightLocks, KeyStrategy, MissClassifier, MissClassifierConfig, Pipeline,
    PredictiveBudgetTracker, PreSimCache, ProfitCalculator, RedisKv, RelayFallback, RelayMode,
    ReserveIndexTracker, RiskGate, RiskGateConfig, StaticQuoter, TipMode, TokenInfo,
    TokenRegistry, TraceStoreConfig,
};

/// Environment variable names for endpoints and contracts.
mod env_names {
    pub const WS_URL: &str = "WS_URL";
    pub const HTTP_URL: &str = "HTTP_URL";
    pub const SEND_URL: &str = "SEND_URL";
    pub const RACE_URLS: &str = "RACE_URLS";
    pub const PRIVATE_URL: &str = "PRIVATE_URL";
    pub const POOL: &str = "POOL";
    pub const DATA_PROVIDER: &str = "DATA_PROVIDER";
    pub const PRIVATE_KEYS: &str = "PRIVATE_KEYS";
    pub const REDIS_URL: &str = "REDIS_URL";
}

#[derive(Parser)]
#[command(name = "sentinel", about = "Liquidation bot for an Aave v3-style pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot: bootstrap, then the event/head/price pipelines.
    Run,
    /// Connectivity check: endpoints, chain id, oracle feeds.
    Diag,
    /// Re-derive health factors inside a dump and report deviations.
    VerifyDump {
        path: PathBuf,
        /// Allowed deviation in percent.
        #[arg(long, default_value_t = 5.0)]
        tolerance: f64,
    },
    /// Recompute HF for users behind the most recent competitor
    /// liquidations.
    BackfillHf {
        #[arg(long, default_value_t = 20)]
        recent: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sentinel_core=debug,sentinel_chain=debug")),
        )
        .init();

    let cli = Cli::parse();

    let bot = BotConfig::from_env();
    bot.log_config();
    init_config(bot.clone());

    match cli.command {
        Command::Run => run(bot).await,
        Command::Diag => diag(bot).await,
        Command::VerifyDump { path, tolerance } => verify_dump_cmd(&path, tolerance),
        Command::BackfillHf { recent } => backfill_hf(bot, recent).await,
    }
}

async fn run(bot: BotConfig) -> Result<()> {
    info!("Starting Sentinel liquidation bot");

    let pipeline = build_pipeline(&bot).await?;

    info!("Bootstrapping...");
    pipeline.bootstrap().await?;

    info!("Starting pipelines...");
    pipeline.run().await
}

async fn diag(bot: BotConfig) -> Result<()> {
    let endpoints = build_endpoints().await?;

    let chain_id = endpoints.chain_id().await?;
    let head = endpoints.block_number().await?;
    info!(chain_id = chain_id, head = head, "Endpoint roundtrip ok");

    let tokens = Arc::new(TokenRegistry::new(default_tokens()));
    let oracle = Arc::new(PriceOracle::new(
        endpoints.clone(),
        oracle_config(&bot),
        default_feeds(),
    ));
    oracle.refresh_all(head).await?;
    info!(
        feeds = oracle.cached_count(),
        readiness = ?oracle.readiness(),
        "Oracle refresh complete"
    );
    for symbol in tokens.symbols() {
        match oracle.get_price(symbol) {
            Ok(point) => info!(symbol = symbol, price_usd = point.price_usd, "Price"),
            Err(e) => warn!(symbol = symbol, error = %e, "Price unavailable"),
        }
    }

    let healthy = endpoints.health_check(30_000).await;
    info!(healthy = healthy, "Diag complete");
    Ok(())
}

fn verify_dump_cmd(path: &PathBuf, tolerance: f64) -> Result<()> {
    let dump = HotSetDump::load(path)?;
    info!(
        schema = dump.schema_version,
        entries = dump.entries.len(),
        mode = %dump.mode,
        "Dump loaded"
    );

    let report = verify_dump(&dump, tolerance);
    info!(
        checked = report.checked,
        passed = report.passed,
        skipped = report.skipped,
        failures = report.failures.len(),
        "Verification complete"
    );
    for failure in &report.failures {
        warn!(
            user = %failure.address,
            recorded = failure.recorded_hf,
            derived = failure.derived_hf,
            deviation_pct = failure.deviation_pct,
            "HF deviation beyond tolerance"
        );
    }
    if !report.is_clean() {
        anyhow::bail!("{} entries deviate beyond {tolerance}%", report.failures.len());
    }
    Ok(())
}

async fn backfill_hf(bot: BotConfig, recent: usize) -> Result<()> {
    use alloy::providers::{Provider, ProviderBuilder};
    use alloy::rpc::types::Filter;
    use sentinel_chain::contracts::pool_signatures;

    let endpoints = build_endpoints().await?;
    let head = endpoints.block_number().await?;

    // Walk back over LiquidationCall logs only, newest chunk first, until
    // enough events are collected.
    let provider = ProviderBuilder::new().on_http(endpoints.http_url().parse()?);
    let mut liquidated: Vec<alloy::primitives::Address> = Vec::new();
    let chunk = bot.ingest.chunk_size.max(1);
    let mut to_block = head;

    while liquidated.len() < recent && to_block > head.saturating_sub(bot.ingest.backfill_blocks) {
        let from_block = to_block.saturating_sub(chunk - 1);
        let filter = Filter::new()
            .address(endpoints.pool_address())
            .event_signature(pool_signatures::LIQUIDATION_CALL)
            .from_block(from_block)
            .to_block(to_block);

        match provider.get_logs(&filter).await {
            Ok(logs) => {
                for log in logs.into_iter().rev() {
                    if let Some(PoolEvent::LiquidationCall { user, .. }) = parse_pool_event(log) {
                        if !liquidated.contains(&user) {
                            liquidated.push(user);
                        }
                    }
                }
            }
            Err(e) => warn!(from = from_block, to = to_block, error = %e, "getLogs failed"),
        }
        if from_block == 0 {
            break;
        }
        to_block = from_block.saturating_sub(1);
    }
    liquidated.truncate(recent.max(1));
    info!(count = liquidated.len(), "Recent competitor liquidations found");

    let engine = HealthFactorEngine::new(endpoints.clone(), hf_engine_config(&bot));
    let batch = engine.batch(&liquidated, Some(head)).await?;

    for (user, data) in &batch.accounts {
        info!(
            user = %user,
            hf = data.hf(),
            collateral_usd = data.collateral_usd(),
            debt_usd = data.debt_usd(),
            "Recomputed"
        );
    }
    for (user, reason) in &batch.failures {
        warn!(user = %user, reason = %reason, "Recompute failed");
    }
    Ok(())
}

async fn build_endpoints() -> Result<Arc<EndpointManager>> {
    use sentinel_core::config::env as env_parse;

    let http_url = env_parse::require_string(env_names::HTTP_URL)?;
    let ws_url = env_parse::require_string(env_names::WS_URL)?;
    let send_url =
        env_parse::optional_string(env_names::SEND_URL).unwrap_or_else(|| http_url.clone());
    let race_urls = env_parse::parse_list(env_names::RACE_URLS);
    let private_url = env_parse::optional_string(env_names::PRIVATE_URL);

    let pool = env_parse::optional_string(env_names::POOL)
        .unwrap_or_else(|| "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5".to_string())
        .parse()
        .context("invalid POOL address")?;
    let data_provider = env_parse::optional_string(env_names::DATA_PROVIDER)
        .unwrap_or_else(|| "0x2d8A3C5677189723C4cB8873CfC9C8976FDF38Ac".to_string())
        .parse()
        .context("invalid DATA_PROVIDER address")?;

    Ok(Arc::new(
        EndpointManager::new(
            &http_url,
            &send_url,
            race_urls,
            private_url,
            &ws_url,
            pool,
            data_provider,
        )
        .await?,
    ))
}

async fn build_pipeline(bot: &BotConfig) -> Result<Arc<Pipeline>> {
    use sentinel_core::config::env as env_parse;
    use std::time::Duration;

    let endpoints = build_endpoints().await?;
    info!(
        pool = %endpoints.pool_address(),
        data_provider = %endpoints.data_provider_address(),
        "Endpoints initialized"
    );

    let tokens = Arc::new(TokenRegistry::new(default_tokens()));
    info!(token_count = tokens.len(), "Token registry loaded");

    let ingestor = Arc::new(EventIngestor::new(
        endpoints.ws_url().to_string(),
        endpoints.http_url().to_string(),
        endpoints.pool_address(),
        ingestor_config(bot),
    ));

    let oracle = Arc::new(PriceOracle::new(
        endpoints.clone(),
        oracle_config(bot),
        default_feeds(),
    ));

    let hf_engine = Arc::new(HealthFactorEngine::new(
        endpoints.clone(),
        hf_engine_config(bot),
    ));

    let candidates = Arc::new(CandidateManager::new(bot.watch.max_candidates));
    let hot_set = Arc::new(HotSetTracker::new(
        bot.watch.hot_hf_threshold,
        bot.watch.warm_hf_threshold,
        bot.watch.max_hot,
        bot.watch.max_warm,
    )?);
    let reserve_index = Arc::new(ReserveIndexTracker::new(bot.hf.index_recheck_bps));

    let budget = Arc::new(PredictiveBudgetTracker::new(BudgetConfig {
        max_users_per_tick: bot.budget.max_users_per_tick,
        max_ticks_per_minute: bot.budget.max_ticks_per_minute,
        hourly_budget_usd: bot.budget.hourly_budget_usd,
        cost_per_hf_read_usd: bot.budget.cost_per_hf_read_usd,
        max_users_per_asset_signal: bot.budget.max_users_per_asset_signal,
    }));
    let fallback = Arc::new(FallbackOrchestrator::new(FallbackConfig {
        shock_bps: bot.fallback.shock_bps,
        shock_window_ms: 60_000,
        near_only: bot.fallback.near_only,
        broaden_near_band: bot.fallback.broaden_near_band,
        max_users_per_tick: bot.budget.max_users_per_tick,
    }));

    let presim = Arc::new(PreSimCache::new(
        bot.cache.presim_capacity,
        bot.cache.presim_ttl_blocks,
    ));
    let templates = Arc::new(sentinel_chain::TemplateCache::new(
        bot.cache.template_capacity,
        bot.cache.template_refresh_blocks,
    ));

    let profit = Arc::new(ProfitCalculator::new(bot.execution.fee_bps));
    let risk_gate = Arc::new(RiskGate::new(RiskGateConfig {
        execution_enabled: bot.execution.enabled,
        gas_price_cap_wei: (bot.execution.gas_price_cap_gwei * 1e9) as u128,
        execution_hf_threshold_wad: WAD,
        dust_base: usd_to_base(bot.execution.dust_usd),
        min_debt_base: usd_to_base(bot.execution.min_debt_usd),
        min_repay_base: usd_to_base(bot.execution.min_repay_usd),
        min_profit_base: usd_to_base(bot.execution.min_profit_usd),
        daily_loss_limit_base: usd_to_base(bot.execution.daily_loss_limit_usd).to::<u128>(),
    }));

    let traces = Arc::new(DecisionTraceStore::new(TraceStoreConfig {
        max_users: bot.trace.max_users,
        ring_size: bot.trace.ring_size,
        trace_ttl_ms: bot.trace.trace_ttl_secs * 1_000,
        miss_window_ms: bot.trace.miss_window_ms,
    }));

    // Signing keys, comma separated; material never appears in logs.
    let key_material = env_parse::require_string(env_names::PRIVATE_KEYS)?;
    let keys: Vec<String> = key_material
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    let keys = Arc::new(MultiKeyManager::from_private_keys(
        &keys,
        match bot.submit.key_strategy {
            KeyStrategy::RoundRobin => KeySelection::RoundRobin,
            KeyStrategy::Deterministic => KeySelection::Deterministic,
        },
    )?);

    let miss_classifier = Arc::new(MissClassifier::new(
        keys.addresses(),
        MissClassifierConfig {
            head_lag_blocks: bot.trace.head_lag_blocks,
            hf_transient_blocks: bot.trace.hf_transient_blocks,
            memory_capacity: bot.ingest.dedupe_capacity,
        },
    ));

    let gas_strategy: Arc<dyn sentinel_chain::GasStrategy> = Arc::from(create_gas_strategy(
        bot.execution.gas_price_cap_gwei,
        0.05,
        match bot.execution.tip_mode {
            TipMode::Safe => TipStrategy::Safe,
            TipMode::Mid => TipStrategy::Mid,
            TipMode::Fast => TipStrategy::Fast,
        },
    ));

    let racer = Arc::new(WriteRacer::new(
        endpoints.race_urls().to_vec(),
        Duration::from_millis(bot.submit.race_timeout_ms),
    ));
    let private_tx = Arc::new(PrivateTxSender::new(
        endpoints.clone(),
        racer.clone(),
        PrivateTxConfig {
            mode: match bot.submit.relay_mode {
                RelayMode::Disabled => PrivateMode::Disabled,
                RelayMode::Protect => PrivateMode::Protect,
                RelayMode::Bundle => PrivateMode::Bundle,
            },
            fallback: match bot.submit.relay_fallback {
                RelayFallback::Race => FallbackMode::Race,
                RelayFallback::Direct => FallbackMode::Direct,
            },
            submit_timeout: Duration::from_millis(bot.submit.private_submit_timeout_ms),
        },
    ));
    let burst = Arc::new(GasBurstManager::new(
        endpoints.clone(),
        keys.clone(),
        GasBurstConfig {
            first_delay: Duration::from_millis(bot.submit.bump_first_ms),
            second_delay: Duration::from_millis(bot.submit.bump_second_ms),
            bump_pct: bot.submit.bump_pct,
            max_bumps: bot.submit.max_bumps,
        },
    ));

    // Aggregator quote clients are external; the static quoter stands in
    // until one is injected.
    let quoter = Arc::new(StaticQuoter::new(50));

    let kv = match env_parse::optional_string(env_names::REDIS_URL) {
        Some(url) => match RedisKv::connect(&url).await {
            Ok(kv) => Some(kv),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, in-memory locks only");
                None
            }
        },
        None => None,
    };
    let inflight = Arc::new(InFlightLocks::new(bot.submit.inflight_ttl_ms, kv));

    let pipeline = Arc::new(Pipeline::new(
        bot.clone(),
        endpoints,
        ingestor,
        hf_engine,
        oracle,
        tokens,
        candidates,
        hot_set,
        reserve_index,
        budget,
        fallback,
        presim,
        templates,
        profit,
        risk_gate,
        traces,
        miss_classifier,
        keys,
        gas_strategy,
        private_tx,
        racer,
        burst,
        quoter,
        inflight,
    ));

    info!("All components initialized");
    Ok(pipeline)
}

fn ingestor_config(bot: &BotConfig) -> IngestorConfig {
    IngestorConfig {
        backfill_blocks: bot.ingest.backfill_blocks,
        chunk_size: bot.ingest.chunk_size,
        max_logs: bot.ingest.max_logs,
        backfill_timeout: bot.backfill_timeout(),
        dedupe_capacity: bot.ingest.dedupe_capacity,
    }
}

fn oracle_config(bot: &BotConfig) -> OracleConfig {
    let mut aliases = std::collections::HashMap::new();
    aliases.insert("USDbC".to_string(), "USDC".to_string());
    OracleConfig {
        freshness_window: std::time::Duration::from_secs(bot.oracle.freshness_window_secs),
        refresh_index_bps: bot.oracle.refresh_index_bps,
        dev_stub_prices: bot.oracle.dev_stub_prices,
        aliases,
    }
}

fn hf_engine_config(bot: &BotConfig) -> HfEngineConfig {
    HfEngineConfig {
        batch_size: bot.hf.batch_size,
        chunk_timeout: bot.chunk_timeout(),
        cache_ttl: std::time::Duration::from_secs(bot.hf.cache_ttl_secs),
        stable_cache_ttl: std::time::Duration::from_secs(bot.hf.stable_cache_ttl_secs),
    }
}

/// Base mainnet reserve tokens.
fn default_tokens() -> Vec<TokenInfo> {
    let parse = |s: &str| s.parse().expect("static address");
    vec![
        TokenInfo {
            symbol: "WETH".to_string(),
            address: parse("0x4200000000000000000000000000000000000006"),
            decimals: 18,
            stablecoin: false,
            liquidation_bonus_bps: 500,
        },
        TokenInfo {
            symbol: "USDC".to_string(),
            address: parse("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            decimals: 6,
            stablecoin: true,
            liquidation_bonus_bps: 450,
        },
        TokenInfo {
            symbol: "USDbC".to_string(),
            address: parse("0xd9aAEc86B65D86f6A7B5B1b0c42FFA531710b6CA"),
            decimals: 6,
            stablecoin: true,
            liquidation_bonus_bps: 450,
        },
        TokenInfo {
            symbol: "cbETH".to_string(),
            address: parse("0x2Ae3F1Ec7F1F5012CFEab0185bfc7aa3cf0DEc22"),
            decimals: 18,
            stablecoin: false,
            liquidation_bonus_bps: 750,
        },
        TokenInfo {
            symbol: "wstETH".to_string(),
            address: parse("0xc1CBa3fCea344f92D9239c08C0568f6F2F0ee452"),
            decimals: 18,
            stablecoin: false,
            liquidation_bonus_bps: 700,
        },
        TokenInfo {
            symbol: "DAI".to_string(),
            address: parse("0x50c5725949A6F0c72E6C4a641F24049A917DB0Cb"),
            decimals: 18,
            stablecoin: true,
            liquidation_bonus_bps: 500,
        },
    ]
}

/// Chainlink feeds on Base for the default token set.
fn default_feeds() -> Vec<FeedConfig> {
    let parse = |s: &str| s.parse().expect("static address");
    vec![
        FeedConfig {
            symbol: "WETH".to_string(),
            aggregator: parse("0x71041dddad3595F9CEd3DcCFBe3D1F4b0a16Bb70"),
            ratio_base: None,
        },
        FeedConfig {
            symbol: "USDC".to_string(),
            aggregator: parse("0x7e860098F58bBFC8648a4311b374B1D669a2bc6B"),
            ratio_base: None,
        },
        FeedConfig {
            symbol: "cbETH".to_string(),
            aggregator: parse("0xd7818272B9e248357d13057AAb0B417aF31E817d"),
            ratio_base: None,
        },
        FeedConfig {
            symbol: "wstETH".to_string(),
            aggregator: parse("0xB88BAc61a4Ca37C43a3725912B1f472c9A5bc061"),
            ratio_base: Some("WETH".to_string()),
        },
        FeedConfig {
            symbol: "DAI".to_string(),
            aggregator: parse("0x591e79239a7d679378eC8c847e5038150364C78F"),
            ratio_base: None,
        },
    ]
}
