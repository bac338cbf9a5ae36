use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use hatchway_config::GatewayConfig;

#[derive(Parser)]
#[command(name = "hatchway", about = "Hatchway — interactive-access gateway for sandboxed jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway for one workload.
    Serve {
        /// Listen address as HOST:PORT; port 0 picks a free port.
        #[arg(long, env = "HATCHWAY_ADDRESS")]
        address: String,

        /// Shared authorization secret required from callers.
        #[arg(long, env = "HATCHWAY_AUTH_SECRET", hide_env_values = true)]
        auth_secret: String,

        /// Identifier of the workload this gateway fronts.
        #[arg(long, env = "HATCHWAY_WORKLOAD_ID")]
        workload_id: String,

        /// Container the runtime execs into.
        #[arg(long, env = "HATCHWAY_CONTAINER_ID")]
        container_id: String,

        /// Container runtime CLI binary.
        #[arg(long, env = "HATCHWAY_RUNTIME", default_value = hatchway_config::DEFAULT_RUNTIME)]
        runtime: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "hatchway starting");

    match cli.command {
        Commands::Serve {
            address,
            auth_secret,
            workload_id,
            container_id,
            runtime,
        } => {
            let config =
                GatewayConfig::new(&address, auth_secret, workload_id, container_id, runtime)?;
            let gateway = hatchway_gateway::Gateway::bind(config).await?;
            // The orchestrator reads this to learn the bound port.
            info!(address = %gateway.advertised_address(), "gateway ready");
            gateway.serve().await
        }
    }
}
