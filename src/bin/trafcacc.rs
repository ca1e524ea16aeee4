use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trafcacc::accelerate::{run_backend, run_frontend};
use trafcacc::config::TrafcaccConfig;
use trafcacc::endpoint::Endpoint;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProxyRole {
    Frontend,
    Backend,
}

/// Accelerates TCP traffic by spreading it over several parallel TCP and UDP links
#[derive(Parser)]
struct Args {
    /// e.g. tcp://0.0.0.0:8080 for the front-end, or udp://0.0.0.0:4000-4003,tcp://0.0.0.0:5000 for the back-end
    #[clap(long)]
    listen: String,

    /// the back-end's link endpoints for the front-end, or the real service for the back-end
    #[clap(long)]
    upstream: String,

    #[clap(long, value_enum)]
    role: ProxyRole,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .try_init()
        .ok();

    let listen = Endpoint::parse_list(&args.listen)?;
    let upstream = Endpoint::parse_list(&args.upstream)?;

    let config = TrafcaccConfig::default();
    config.validate()?;

    info!("starting {:?}", args.role);
    match args.role {
        ProxyRole::Frontend => run_frontend(&listen, &upstream, config).await,
        ProxyRole::Backend => run_backend(&listen, &upstream, config).await,
    }
}
