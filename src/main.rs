use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainwatch_dispatcher::callbacks::PgCrawlerHooks;
use chainwatch_dispatcher::config::Config;
use chainwatch_dispatcher::crawler::{Crawler, CrawlerSettings, GatewayStrategy};
use chainwatch_dispatcher::db::{repository, JobStatusStore, PgJobStatusStore};
use chainwatch_dispatcher::gateway::decoder::AbiCatalog;
use chainwatch_dispatcher::gateway::events::EventExtractors;
use chainwatch_dispatcher::gateway::evm::{EvmGateway, GatewayOptions};
use chainwatch_dispatcher::gateway::rpc::RotatingRpc;
use chainwatch_dispatcher::gateway::Gateway;
use chainwatch_dispatcher::queue::backend::{PgQueueBackend, QueueBackend};
use chainwatch_dispatcher::queue::webhook::{HttpWebhook, WebhookSink};
use chainwatch_dispatcher::queue::{JobQueue, QueueOptions};
use chainwatch_dispatcher::registration::{self, PgTokenLookup, RegistrationHandler};
use chainwatch_dispatcher::registry::types::Currency;
use chainwatch_dispatcher::registry::{CurrencyRegistry, GatewayRegistry};
use chainwatch_dispatcher::worker::{join_workers, IntervalWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Crawler,
    Worker,
    All,
}

impl Mode {
    fn parse(raw: &str) -> eyre::Result<Self> {
        match raw {
            "crawler" => Ok(Self::Crawler),
            "worker" => Ok(Self::Worker),
            "all" => Ok(Self::All),
            other => Err(eyre::eyre!("Unknown mode '{}', expected crawler, worker or all", other)),
        }
    }

    fn crawls(self) -> bool {
        self != Self::Worker
    }

    fn delivers(self) -> bool {
        self != Self::Crawler
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

/// Seed the registry with the file configs of every chain.
fn seed_registry(config: &Config) -> eyre::Result<(Arc<CurrencyRegistry>, Vec<Currency>)> {
    let registry = Arc::new(CurrencyRegistry::new());
    let mut natives = Vec::new();
    for chain in &config.chains {
        let native = registry.get_one_native_currency(chain.platform()?)?;
        registry.set_currency_config(&native, chain.to_patch())?;
        natives.push(native);
    }
    Ok((registry, natives))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();

    tracing::info!("ChainWatch Dispatcher starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let mode = Mode::parse(&std::env::args().nth(2).unwrap_or_else(|| "all".to_string()))?;

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        mode = ?mode,
        "Configuration loaded from {}",
        config_path
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    let (registry, natives) = seed_registry(&config)?;

    let mut abis = AbiCatalog::builtin()?;
    for (key, path) in &config.abis {
        abis.load_file(key, path)?;
    }
    let extractors = EventExtractors::builtin();
    extractors.validate(&abis)?;
    let abis = Arc::new(abis);
    let extractors = Arc::new(extractors);

    for chain in &config.chains {
        for contract in chain.registrations()? {
            registration::register_contract(&registry, &abis, &extractors, &chain.platform, contract)?;
        }
    }
    for (platform, contract) in repository::load_token_contracts(&pool).await? {
        let address = contract.contract_address.clone();
        if let Err(e) = registration::register_contract(&registry, &abis, &extractors, &platform, contract) {
            tracing::warn!(contract = %address, platform = %platform, error = %e, "Skipping stored contract");
        }
    }

    // Stored overrides go last so token rows find their currency.
    let applied = registry
        .apply_stored_configs(repository::load_currency_configs(&pool).await?)
        .map_err(|e| eyre::eyre!("Stored currency config rejected: {}", e))?;
    tracing::info!(rows = applied, "Stored currency configs applied");

    let job_store: Arc<dyn JobStatusStore> = Arc::new(PgJobStatusStore::new(pool.clone()));
    let queue_backend: Arc<dyn QueueBackend> = Arc::new(PgQueueBackend::new(pool.clone()));

    let gateways = Arc::new(GatewayRegistry::new(registry.clone()));
    for (chain, native) in config.chains.iter().zip(&natives) {
        let options = GatewayOptions::from_chain(chain, config.queue.attempts);
        let registry = registry.clone();
        let abis = abis.clone();
        let extractors = extractors.clone();
        let job_store = job_store.clone();
        let queue_backend = queue_backend.clone();
        gateways.register_factory(&native.symbol, move |currency| {
            let currency_config = registry.get_currency_config(currency)?;
            let rpc = Arc::new(RotatingRpc::new(currency.symbol.clone(), currency_config.rpc_endpoints()));
            rpc.follow_config(&registry, currency);
            Ok(Arc::new(EvmGateway::new(
                currency.clone(),
                registry.clone(),
                rpc,
                abis.clone(),
                extractors.clone(),
                job_store.clone(),
                queue_backend.clone(),
                options.clone(),
            )) as Arc<dyn Gateway>)
        });
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    if mode.crawls() {
        let hooks = Arc::new(PgCrawlerHooks::new(pool.clone()));
        for (chain, native) in config.chains.iter().zip(&natives) {
            gateways.get_gateway(&native.symbol)?;
            let crawler = Crawler::new(
                native.clone(),
                registry.clone(),
                Arc::new(GatewayStrategy::new(gateways.clone(), native.symbol.clone())),
                hooks.clone(),
                CrawlerSettings::from_chain(chain),
            );
            let worker = IntervalWorker::new(crawler);
            let shutdown = shutdown.clone();
            let chain_name = chain.chain_name.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.start(shutdown).await {
                    tracing::error!(chain = %chain_name, error = %e, "Crawler failed");
                }
            }));
        }

        let handler = Arc::new(RegistrationHandler::new(
            registry.clone(),
            abis.clone(),
            extractors.clone(),
            Arc::new(PgTokenLookup::new(pool.clone())),
        ));
        let pool = pool.clone();
        let app_id = config.app_id.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = registration::listen(&pool, &app_id, handler, shutdown).await {
                tracing::error!(error = %e, "Registration listener failed");
            }
        }));
    }

    if mode.delivers() {
        let sink: Arc<dyn WebhookSink> = Arc::new(HttpWebhook::new(
            config.webhook.token.clone(),
            Duration::from_millis(config.webhook.timeout_ms),
        )?);
        let options = QueueOptions::from(&config.queue);
        for native in &natives {
            let currency_config = registry.get_currency_config(native)?;
            let queue = JobQueue::new(
                currency_config.queue_name,
                currency_config.webhook_api,
                queue_backend.clone(),
                sink.clone(),
                job_store.clone(),
                options.clone(),
            );
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = queue.run(shutdown).await {
                    tracing::error!(queue = %queue.name(), error = %e, "Queue worker failed");
                }
            }));
        }
    }

    tracing::info!("All workers started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all workers...");
    shutdown.cancel();

    let failed = join_workers(handles).await;
    if failed > 0 {
        tracing::error!(failed, "Some workers did not stop cleanly");
    }

    tracing::info!("ChainWatch Dispatcher stopped gracefully");
    Ok(())
}
