use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::config::{LogFormat, LoggingConfig, WardenConfig};
use warden::observability::{Collector, Metrics};
use warden::otp::{OtpEngine, OtpError};
use warden::ratelimit::{client_identifier, RateLimiter};
use warden::store::{AtomicStore, RedisStore};

#[derive(Parser)]
#[command(name = "warden", version, about = "Throttling and cooldown engine")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one admission decision for a client
    Admit {
        /// Peer address of the request
        remote_addr: String,

        /// Value of the X-Forwarded-For header
        #[arg(long)]
        forwarded_for: Option<String>,

        /// Value of the X-Real-IP header
        #[arg(long)]
        real_ip: Option<String>,
    },

    /// Show active limiter windows
    Stats {
        /// Maximum number of windows to describe
        #[arg(long)]
        sample: Option<usize>,

        /// Print the metric registry in Prometheus text format instead
        #[arg(long)]
        prometheus: bool,
    },

    /// One-time code operations
    Otp {
        #[command(subcommand)]
        command: OtpCommand,
    },

    /// Sample limiter state periodically until interrupted
    Collect,
}

#[derive(Subcommand)]
enum OtpCommand {
    /// Issue a code
    Issue { email: String, identifier: String },
    /// Verify a submitted code
    Verify {
        email: String,
        identifier: String,
        code: String,
    },
    /// Show the running verification cooldown
    Cooldown { email: String, identifier: String },
    /// Drop the live code
    Invalidate { email: String, identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = WardenConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting warden");

    let store: Arc<dyn AtomicStore> = Arc::new(RedisStore::connect(&config.store.redis_url).await?);
    let metrics = Arc::new(Metrics::new(config.observability.namespace.clone()));

    match cli.command {
        Command::Admit {
            remote_addr,
            forwarded_for,
            real_ip,
        } => {
            let limiter = RateLimiter::new(store, metrics, &config.rate_limiting)?;
            let identifier =
                client_identifier(forwarded_for.as_deref(), real_ip.as_deref(), &remote_addr);
            let decision = limiter.admit(&identifier).await;

            let headers: serde_json::Map<_, _> = decision
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), json!(value)))
                .collect();
            print_json(&json!({
                "identifier": identifier,
                "status": decision.status_code(),
                "decision": decision,
                "headers": headers,
            }))?;

            Ok(if decision.allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Stats { sample, prometheus } => {
            let limiter = RateLimiter::new(store, metrics.clone(), &config.rate_limiting)?;
            let stats = limiter
                .stats(sample.unwrap_or(config.observability.sample_size))
                .await?;
            metrics.set_active_limits(stats.active_limits as u64);

            if prometheus {
                print!("{}", metrics.encode()?);
            } else {
                print_json(&stats)?;
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Otp { command } => {
            let engine = OtpEngine::new(store, metrics, &config.otp, config.store.timeout())?;
            run_otp(&engine, command).await
        }

        Command::Collect => {
            let collector = Collector::from_config(store, metrics.clone(), &config);
            info!(interval = ?collector.interval(), "Collector running");
            let handle = collector.spawn();

            shutdown_signal().await;
            handle.shutdown().await;

            print!("{}", metrics.encode()?);
            info!("Collector stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_otp(engine: &OtpEngine, command: OtpCommand) -> anyhow::Result<ExitCode> {
    let result = match command {
        OtpCommand::Issue { email, identifier } => {
            engine.issue(&email, &identifier).await.map(|issued| {
                json!({
                    "code": issued.code,
                    "expires_at": issued.expires_at,
                    "resend_after": issued.resend_after.as_secs(),
                })
            })
        }
        OtpCommand::Verify {
            email,
            identifier,
            code,
        } => engine.verify(&email, &identifier, &code).await.map(|v| {
            json!({
                "verified": true,
                "email": v.email,
                "identifier": v.identifier,
                "verified_at": v.verified_at,
            })
        }),
        OtpCommand::Cooldown { email, identifier } => engine
            .check_cooldown(&email, &identifier)
            .await
            .map(|cooldown| json!({ "cooldown": cooldown })),
        OtpCommand::Invalidate { email, identifier } => engine
            .invalidate(&email, &identifier)
            .await
            .map(|()| json!({ "invalidated": true })),
    };

    match result {
        Ok(body) => {
            print_json(&body)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_json(&error_body(&err))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn error_body(err: &OtpError) -> serde_json::Value {
    json!({
        "error": {
            "code": err.code(),
            "status": err.status_code(),
            "message": err.to_string(),
            "details": err.details(),
        }
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr so command output stays parseable.
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
