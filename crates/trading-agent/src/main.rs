use std::sync::Arc;
use std::time::Duration;

use alpaca_broker::{AlpacaClient, AlpacaMarketData};
use anyhow::{Context, Result};
use broker_trait::{BrokerClient, MarketDataSource};
use execution_gateway::{
    AdaptiveRateLimiter, ExecutionGateway, GatewayContext, MarketDataSupervisor, PaperBroker,
    Sleeper, TokioSleeper,
};
use risk_manager::{CircuitBreaker, RiskManager};
use strategy_router::StrategyRouter;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use trading_core::{
    shutdown_channel, ChannelSink, Clock, EventSink, FanoutSink, SystemClock, TracingSink,
};

mod config;
mod engine;
mod journal;
mod signals;
mod sim;

use config::{AgentConfig, BrokerMode};
use engine::{Engine, EngineConfig};
use journal::EventJournal;
use signals::{BandReverter, TrendFollower};
use sim::RandomWalkSource;

/// Tick buffer between the feed and the engine
const TICK_CHANNEL_CAPACITY: usize = 4096;

/// How long each task gets to wind down after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting execution core");

    // 2. Load configuration
    let config = AgentConfig::from_env().context("Invalid configuration")?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Watchlist: {}", config.watchlist.join(", "));
    tracing::info!("  Broker: {:?}", config.broker_mode);
    tracing::info!("  Bar size: {}s", config.bar_duration.as_secs());
    tracing::info!(
        "  Limits: ${} per symbol, ${} gross, {:.0}% concentration",
        config.limits.max_symbol_notional,
        config.limits.max_gross_exposure,
        config.limits.max_concentration * 100.0
    );
    tracing::info!(
        "  Broker rate limit: {}/min (burst {}), breaker opens after {} failures",
        config.rate_limit.per_minute,
        config.rate_limit.burst,
        config.breaker.failure_threshold
    );

    // 3. Safety gate: live endpoints require LIVE_TRADING_APPROVED=yes
    if config.is_live() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            anyhow::bail!(
                "ALPACA_BASE_URL points to live trading ({}). Set LIVE_TRADING_APPROVED=yes to enable, or use {} for paper.",
                config.alpaca_base_url,
                alpaca_broker::PAPER_BASE_URL
            );
        }
        tracing::warn!("LIVE TRADING MODE - REAL MONEY AT RISK ({})", config.alpaca_base_url);
    }

    // 4. Event journal
    let journal = EventJournal::connect(&config.journal_url).await?;
    tracing::info!("Event journal ready ({})", config.journal_url);
    let (channel_sink, journal_rx) = ChannelSink::new();
    let events: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![
        Arc::new(TracingSink),
        Arc::new(channel_sink),
    ]));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

    // 5. Broker and market data
    let (broker, source) = build_adapters(&config)?;
    tracing::info!(
        "Broker: {} ({}), market data: {}",
        broker.broker_name(),
        if broker.is_paper() { "paper" } else { "live" },
        source.source_name()
    );

    // 6. Shared guards
    let breaker = CircuitBreaker::new("broker", config.breaker.clone(), clock.clone(), events.clone());
    let limiter = Arc::new(AdaptiveRateLimiter::new(
        config.rate_limit.clone(),
        clock.clone(),
        sleeper.clone(),
    ));

    // 7. Market-data supervisor
    let supervisor = MarketDataSupervisor::new(
        source,
        config.watchlist.clone(),
        config.feed.clone(),
        clock.clone(),
        sleeper.clone(),
        events.clone(),
    );
    let feed_health = supervisor.health();

    // 8. Execution gateway
    let ctx = GatewayContext {
        limiter,
        breaker: breaker.clone(),
        feed: feed_health,
        clock: clock.clone(),
        sleeper,
        events: events.clone(),
    };
    let (gateway, gateway_events) = ExecutionGateway::new(broker, config.gateway.clone(), ctx);
    let gateway_handle = gateway.handle();

    // 9. Engine
    let risk = RiskManager::new(
        config.limits.clone(),
        config.stops.clone(),
        config.initial_capital,
        clock.clone(),
        events.clone(),
    )
    .with_breaker(breaker);
    let router = StrategyRouter::new(config.router.clone())
        .with_generator(Box::new(TrendFollower::default()))
        .with_generator(Box::new(BandReverter::default()));
    let engine = Engine::new(
        EngineConfig {
            bar_duration: config.bar_duration,
            indicators: config.indicators.clone(),
            regime: config.regime.clone(),
        },
        risk,
        router,
        gateway_handle,
        events.clone(),
    );

    // 10. Spawn tasks
    let (trigger, shutdown) = shutdown_channel();
    let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);

    let tasks = vec![
        ("journal", tokio::spawn(journal.run(journal_rx, shutdown.clone()))),
        ("gateway", gateway.spawn(shutdown.clone())),
        (
            "engine",
            tokio::spawn(engine.run(tick_rx, gateway_events, shutdown.clone())),
        ),
        ("feed", tokio::spawn(supervisor.run(tick_tx, shutdown))),
    ];

    tracing::info!("Execution core is running. Press Ctrl+C to stop.");

    // 11. Wait for SIGINT / SIGTERM
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    tracing::info!("Shutdown signal received, exiting gracefully...");
    trigger.trigger();

    for (name, task) in tasks {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(())) => tracing::debug!("{} task stopped", name),
            Ok(Err(e)) => tracing::error!("{} task failed: {}", name, e),
            Err(_) => tracing::warn!("{} task did not stop within {:?}", name, SHUTDOWN_GRACE),
        }
    }

    tracing::info!("Execution core shut down.");
    Ok(())
}

fn build_adapters(
    config: &AgentConfig,
) -> Result<(Arc<dyn BrokerClient>, Arc<dyn MarketDataSource>)> {
    let credentials = config
        .alpaca_api_key
        .clone()
        .zip(config.alpaca_secret_key.clone());

    let broker: Arc<dyn BrokerClient> = match (config.broker_mode, &credentials) {
        (BrokerMode::Alpaca, Some((key, secret))) => Arc::new(
            AlpacaClient::new(
                key.clone(),
                secret.clone(),
                config.alpaca_base_url.clone(),
                config.gateway.attempt_timeout,
            )
            .context("Failed to build Alpaca client")?,
        ),
        (BrokerMode::Alpaca, None) => anyhow::bail!("Alpaca mode needs ALPACA_API_KEY and ALPACA_SECRET_KEY"),
        (BrokerMode::Paper, _) => Arc::new(PaperBroker::new()),
    };

    let source: Arc<dyn MarketDataSource> = match credentials {
        Some((key, secret)) => Arc::new(AlpacaMarketData::new(key, secret, config.alpaca_data_url.clone())),
        None => {
            tracing::warn!("No Alpaca credentials: using simulated random-walk market data");
            Arc::new(RandomWalkSource::default())
        }
    };

    Ok((broker, source))
}
