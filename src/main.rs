use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use psgate_core::config::{AppConfig, ConfigStore, EnvOverrides};
use psgate_engine::ShellSpec;
use psgate_gateway::{AppState, GatewayServer};
use psgate_mcp::McpServer;
use psgate_tools::{Dispatcher, Pipeline};

#[derive(Parser)]
#[command(name = "psgate", version, about = "Security-enforced PowerShell gateway for AI agents")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "enterprise-config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON-RPC tool transport on stdin/stdout
    Serve {
        /// Also start the HTTP dashboard (optionally at ADDR)
        #[arg(long, value_name = "ADDR")]
        dashboard: Option<Option<String>>,
    },
    /// Classify a command and print the assessment without executing
    Classify {
        /// The command to classify
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print the effective merged configuration
    Config,
    /// Run environment health checks
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON-RPC frames; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PSGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = EnvOverrides::capture().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    match cli.command.unwrap_or(Commands::Serve { dashboard: None }) {
        Commands::Serve { dashboard } => serve(&cli.config, env, dashboard).await,
        Commands::Classify { command } => classify(&cli.config, env, command.join(" ")).await,
        Commands::Config => {
            let config = AppConfig::load(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor => doctor(&cli.config, env),
    }
}

async fn serve(
    config_path: &std::path::Path,
    env: EnvOverrides,
    dashboard: Option<Option<String>>,
) -> anyhow::Result<()> {
    let auth_key = env.auth_key.clone();
    let store = Arc::new(ConfigStore::load(config_path, env)?);
    let snapshot = store.current();

    let shell = ShellSpec::detect()?;
    let pipeline = Pipeline::new(store, shell)?;
    let dispatcher = Arc::new(Dispatcher::new(pipeline.clone()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    if let Some(addr) = dashboard {
        let bind = addr
            .or_else(|| snapshot.gateway.as_ref().map(|g| g.bind.clone()))
            .unwrap_or_else(|| "127.0.0.1:8573".to_string());
        let state = Arc::new(AppState::new(
            pipeline.registry.clone(),
            pipeline.publisher.clone(),
        ));
        let server = GatewayServer::new(bind, state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!(error = %e, "Dashboard server failed");
            }
        });
    }

    info!("psgate serving on stdio");
    McpServer::new(dispatcher, auth_key)
        .serve_stdio(shutdown)
        .await?;
    Ok(())
}

async fn classify(
    config_path: &std::path::Path,
    env: EnvOverrides,
    command: String,
) -> anyhow::Result<()> {
    let store = Arc::new(ConfigStore::load(config_path, env)?);
    let shell = ShellSpec::detect().unwrap_or_else(|_| ShellSpec::posix());
    let pipeline = Pipeline::new(store, shell)?;
    let assessment = pipeline.classify_only(&command);
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

fn doctor(config_path: &std::path::Path, env: EnvOverrides) -> anyhow::Result<()> {
    let mut failures = 0usize;
    let mut report = |name: &str, result: Result<String, String>| match result {
        Ok(detail) => println!("  ok: {} ({})", name, detail),
        Err(detail) => {
            failures += 1;
            println!("FAIL: {} ({})", name, detail);
        }
    };

    report(
        "config",
        AppConfig::load(config_path)
            .map(|_| format!("{} parsed", config_path.display()))
            .map_err(|e| e.to_string()),
    );

    report(
        "patterns",
        ConfigStore::load(config_path, env)
            .map(|store| format!("{} compiled", store.current().patterns.pattern_count()))
            .map_err(|e| e.to_string()),
    );

    report(
        "powershell",
        ShellSpec::detect()
            .map(|s| s.program.display().to_string())
            .map_err(|e| e.to_string()),
    );

    let data_dir = AppConfig::load(config_path)
        .ok()
        .and_then(|c| c.data_dir)
        .unwrap_or_else(|| PathBuf::from("psgate-data"));
    report(
        "data dir",
        std::fs::create_dir_all(&data_dir)
            .map(|_| data_dir.display().to_string())
            .map_err(|e| e.to_string()),
    );

    if failures > 0 {
        anyhow::bail!("{} check(s) failed", failures);
    }
    println!("all checks passed");
    Ok(())
}
