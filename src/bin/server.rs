use anyhow::Context;
use clap::Parser;
use medcycle::{
    api::{build_router, AppState},
    config::{create_default_config_file, AppConfig, LoggingConfig},
};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medcycle-server")]
#[command(about = "Marketplace API for redistributing near-expiry medicines")]
struct Args {
    #[arg(short, long, default_value = "medcycle.toml")]
    config: PathBuf,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Write the default configuration to `--config` and exit.
    #[arg(long)]
    write_default_config: bool,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.write_default_config {
        create_default_config_file(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = AppConfig::load_with_env_overrides(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    config.validate()?;

    init_logging(&config.logging);

    let address = config.get_server_address();
    tracing::info!(
        address = %address,
        stripe = config.is_stripe_configured(),
        model = config.is_llm_configured(),
        "starting medcycle"
    );

    let state = AppState::new(config).await?;
    let app = build_router(state);

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;
    tracing::info!(address = %address, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
