use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use roundtable::gateway::http::router;
use roundtable::gateway::{Dispatcher, GatewayConfig, GatewayHttpState, SystemClock, TamperStore};
use roundtable::providers::OpenAiCompatibleUpstream;

#[derive(Parser, Debug)]
#[command(name = "roundtable-gateway", version, about)]
struct Args {
    /// Gateway config (`.json` or `.toml`). Built-in personas and keys are used without one.
    config: Option<PathBuf>,

    /// Bind address, overriding the config's `listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Tamper log database, overriding `tamper_store.sqlite_path`.
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// File holding the upstream provider key; `OPENAI_API_KEY` is used when it is missing.
    #[arg(long, default_value = "api_key")]
    upstream_key_file: PathBuf,

    /// Upstream base URL, overriding `upstream.base_url`.
    #[arg(long)]
    upstream_base_url: Option<String>,

    /// Emit one JSON object per log line.
    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP/HTTP (requires the `gateway-otel` feature).
    #[arg(long)]
    otel: bool,

    #[arg(long, requires = "otel")]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _otel_guard = init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen.clone() {
        config.listen = listen;
    }
    if let Some(path) = args.sqlite.clone() {
        config.tamper_store.sqlite_path = path;
    }
    if let Some(base_url) = args.upstream_base_url.clone() {
        config.upstream.base_url = base_url;
    }

    let api_key = read_upstream_key(&args.upstream_key_file)?;
    let upstream = OpenAiCompatibleUpstream::with_connect_timeout(
        api_key,
        Duration::from_secs(config.upstream.connect_timeout_secs),
    )?
    .with_base_url(config.upstream.base_url.clone());

    let store = open_tamper_store(&config).await?;
    let dispatcher = Dispatcher::from_config(
        &config,
        Arc::new(SystemClock),
        store,
        Arc::new(upstream),
    );
    tracing::info!(
        personas = dispatcher.personas().len(),
        keys = dispatcher.limiter().len(),
        upstream = %config.upstream.base_url,
        "gateway configured"
    );

    let app = router(GatewayHttpState::new(dispatcher));
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "roundtable-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn read_upstream_key(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().to_string()),
        Err(err) => match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(format!(
                "failed to read upstream key from {}: {err} (and OPENAI_API_KEY is unset)",
                path.display()
            )
            .into()),
        },
    }
}

#[cfg(feature = "gateway-store-sqlite")]
async fn open_tamper_store(
    config: &GatewayConfig,
) -> Result<Arc<dyn TamperStore>, Box<dyn std::error::Error>> {
    let store = roundtable::gateway::SqliteTamperStore::new(&config.tamper_store.sqlite_path);
    store.init().await?;
    tracing::info!(path = %store.path().display(), "tamper log opened");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "gateway-store-sqlite"))]
async fn open_tamper_store(
    _config: &GatewayConfig,
) -> Result<Arc<dyn TamperStore>, Box<dyn std::error::Error>> {
    tracing::warn!("built without gateway-store-sqlite; tamper log is kept in memory");
    Ok(Arc::new(roundtable::gateway::MemoryTamperStore::new()))
}

#[cfg(feature = "gateway-otel")]
fn init_logging(
    args: &Args,
) -> Result<Option<roundtable::gateway::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if !args.otel {
        roundtable::gateway::telemetry::init_tracing(args.json_logs)?;
        return Ok(None);
    }
    Ok(Some(roundtable::gateway::otel::init_tracing(
        "roundtable-gateway",
        args.otel_endpoint.as_deref(),
        args.json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn init_logging(args: &Args) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if args.otel {
        return Err("otel requires `--features gateway-otel`".into());
    }
    roundtable::gateway::telemetry::init_tracing(args.json_logs)?;
    Ok(None)
}
