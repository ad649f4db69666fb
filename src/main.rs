use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use nntplexer::config::Config;
use nntplexer::dispatcher::Dispatcher;
use nntplexer::errors::Error;
use nntplexer::metrics::Metrics;
use nntplexer::pool::PoolProvider;
use nntplexer::registry::{schedule_refresh, ProviderRegistry, UserRegistry};
use nntplexer::server::{Server, ServerCtx};
use nntplexer::session::SessionTable;
use nntplexer::stores::StaticStore;

fn main() {
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    if let Err(e) = runtime.block_on(run()) {
        error!("nntplexer exiting: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "nntplexer.toml".to_string());
    let config = Config::load(&config_path).await?;

    info!("nntplexer is starting...");

    // This binary's default is an empty in-memory `StaticStore`, which is
    // only useful against a config file that was extended to seed it
    // directly. A deployment wires in a real `UserStore`/`ProviderStore`
    // backed by `config.store.dsn`.
    let store = Arc::new(StaticStore::new(vec![], vec![]));

    let user_registry = Arc::new(UserRegistry::new(store.clone()));
    let provider_registry = Arc::new(ProviderRegistry::new(store, config.store.node));
    user_registry.refresh().await?;
    provider_registry.refresh().await?;

    tokio::spawn(schedule_refresh(
        provider_registry.clone(),
        user_registry.clone(),
        Duration::from_secs(5),
    ));

    let metrics = Arc::new(Metrics::new());
    let pools = Arc::new(PoolProvider::new());
    let dispatcher = Arc::new(Dispatcher::new(provider_registry, pools, metrics.clone()));
    let sessions = Arc::new(SessionTable::new(metrics.clone()));

    let ctx = ServerCtx {
        users: user_registry,
        dispatcher,
        sessions,
        metrics,
        proxy_protocol: config.server.proxy_protocol,
    };

    let addr = format!("{}:{}", config.server.addr, config.server.port);
    let server = Server::bind(&addr, ctx).await?;
    server.serve().await
}
