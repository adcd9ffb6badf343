use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palisade::config::PalisadeConfig;
use palisade::ratelimit::Tier;
use palisade::Palisade;

#[derive(Parser, Debug)]
#[command(author, version, about = "Admission control and resilience toolkit")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration (file + environment) as YAML
    Config,
    /// Send synthetic traffic through the limiter and session tracker,
    /// printing one JSON decision per line
    Simulate {
        #[arg(long, default_value = "demo-user")]
        identifier: String,
        #[arg(long, default_value = "/api/chat")]
        endpoint: String,
        #[arg(long, default_value = "free")]
        tier: Tier,
        /// Also check each request as a message of this session
        #[arg(long)]
        session: Option<String>,
        /// Number of rounds
        #[arg(long, default_value_t = 10)]
        requests: usize,
        /// Concurrent requests per round
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Pause between rounds, in seconds
        #[arg(long, default_value_t = 0.0)]
        interval: f64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = PalisadeConfig::load(cli.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            identifier,
            endpoint,
            tier,
            session,
            requests,
            concurrency,
            interval,
        } => {
            let palisade = Palisade::new(config).await?;
            let pause = Duration::try_from_secs_f64(interval)?;

            for round in 0..requests {
                let checks = (0..concurrency.max(1))
                    .map(|_| palisade.allow(&identifier, &endpoint, tier));
                let decisions = futures::future::join_all(checks).await;

                for decision in decisions {
                    let session_decision = session.as_deref().map(|s| palisade.check_session(s));
                    let headers = decision.headers();
                    let line = json!({
                        "round": round,
                        "allowed": decision.allowed
                            && session_decision.as_ref().map_or(true, |s| s.allowed),
                        "rate_limit": decision,
                        "rate_limit_headers": headers,
                        "session": session_decision,
                    });
                    println!("{}", serde_json::to_string(&line)?);
                }

                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }

            palisade.close().await;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
