use anyhow::Result;
use clap::{Parser, Subcommand};
use paddock::activate::{check_activation, ActivationDecision};
use paddock::{create_internal_router, create_raft_router, create_router, Daemon, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "paddockd")]
#[command(about = "Clustered container/VM management daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = "paddock.toml")]
        config: PathBuf,
    },
    Init {
        #[arg(short, long, default_value = "paddock.toml")]
        config: PathBuf,
    },
    // Probes the databases and pokes the daemon socket only when something
    // actually needs it running.
    Activateifneeded {
        #[arg(short, long, default_value = "paddock.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paddock=info,openraft=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config: config_path } => {
            let code = run_daemon(config_path).await?;
            std::process::exit(code);
        }
        Commands::Init { config: config_path } => {
            init_config(config_path)?;
        }
        Commands::Activateifneeded { config: config_path } => {
            activate_if_needed(config_path).await?;
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> Result<i32> {
    let config = if config_path.exists() {
        info!("Loading config from {:?}", config_path);
        NodeConfig::load(&config_path)?
    } else {
        info!("Config file not found, using defaults");
        NodeConfig::default()
    };

    let daemon = Arc::new(Daemon::new(config.clone()).await?);

    let api_router = create_router(daemon.clone());
    let internal_router = create_internal_router(daemon.clone());
    let raft_router = create_raft_router(daemon.clone());
    let router = api_router.merge(internal_router).merge(raft_router);

    let listener = TcpListener::bind(&config.listen_addr()).await?;
    info!("API server listening on {}", config.listen_addr());

    let daemon_clone = daemon.clone();
    let shutdown_daemon = daemon.clone();
    let api_handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::signal::ctrl_c().await.ok();
                shutdown_daemon.shutdown();
            })
            .await;
        if let Err(e) = result {
            error!("API server error: {}", e);
        }
    });

    let daemon_handle = tokio::spawn(async move {
        if let Err(e) = daemon_clone.run().await {
            error!("Daemon error: {}", e);
        }
    });

    let _ = daemon_handle.await;
    api_handle.abort();

    // Exit 0 on an intentional dissolve so a socket-activated unit restarts
    // the daemon stand-alone.
    Ok(daemon.exit_code().unwrap_or(0))
}

async fn activate_if_needed(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        NodeConfig::default()
    };

    match check_activation(&config.data_dir)? {
        ActivationDecision::StayDown => {
            debug!("No need to start the daemon now");
        }
        ActivationDecision::Activate { reason } => {
            info!("Activating daemon: {}", reason);
            // Touching the socket is enough to wake a socket-activated
            // daemon.
            let _ = tokio::net::TcpStream::connect(config.listen_addr()).await;
        }
    }

    Ok(())
}

fn init_config(config_path: PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config file already exists: {:?}", config_path);
    }

    let config = NodeConfig::default();
    config.save(&config_path)?;
    println!("Created config file: {:?}", config_path);
    println!("\nEdit the config file to:");
    println!("  - Set a unique server_name");
    println!("  - Pick the address and port to bind");
    println!("  - Point data_dir at persistent storage");

    Ok(())
}
