//! toolgate: authenticated, policy-controlled gateway for MCP tool servers
//!
//! Usage:
//!   toolgate serve
//!   toolgate keys create <name> --role analyst
//!   toolgate servers register research.toml
//!   toolgate rules add analyst 'research:*'
//!
//! Every command works on the database named in the config file.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use toolgate_core::config::DEFAULT_ADMIN_KEY;
use toolgate_core::native::builtin::register_builtins;
use toolgate_core::{AppConfig, NativeCatalog};
use toolgate_gateway::{ConnectionPool, Gateway, GatewayServer, RetryPolicy};
use toolgate_mcp::TransportConnector;
use toolgate_store::{CallLog, Database, Policy, Registry};

#[derive(Parser)]
#[command(name = "toolgate", version)]
#[command(about = "Authenticated, policy-controlled gateway for MCP tool servers", long_about = None)]
struct Cli {
    /// Config file (default: ~/.toolgate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Listen address, overriding [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Manage tool servers
    Servers {
        #[command(subcommand)]
        action: ServerCommands,
    },

    /// Manage policy rules
    Rules {
        #[command(subcommand)]
        action: RuleCommands,
    },

    /// Show call statistics
    Stats,

    /// Show recent tool calls, newest first
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Mint a key; the secret is printed once
    Create {
        name: String,
        #[arg(long)]
        role: String,
    },
    List,
    /// Deactivate a key by id
    Deactivate { id: String },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Register (or re-register) a server from a TOML manifest
    Register { manifest: PathBuf },
    /// Remove a server and its tools
    Remove { name: String },
    List,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Allow or deny a role access to `server:tool` (either side may be `*`)
    Add {
        role: String,
        resource: String,
        #[arg(long, default_value = "allow")]
        action: String,
    },
    Remove {
        role: String,
        resource: String,
    },
    List,
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Open the database, seed the admin key on first use, and assemble the gateway
async fn build_gateway(config: &AppConfig) -> Result<Arc<Gateway>> {
    let db = Database::open(&config.database.path)?;
    let policy = Policy::new(db.clone(), config.policy.evaluation);

    let seeded = policy
        .bootstrap(&config.policy.admin_role, &config.policy.bootstrap_admin_key)
        .await
        .context("Failed to seed admin key")?;
    if seeded {
        info!("Seeded admin key for role '{}'", config.policy.admin_role);
        if config.policy.bootstrap_admin_key == DEFAULT_ADMIN_KEY {
            warn!(
                "The admin key is the well-known default '{}'. Set [policy] bootstrap_admin_key or create a new admin key and deactivate this one.",
                DEFAULT_ADMIN_KEY
            );
        }
    }

    let mut natives = NativeCatalog::new();
    register_builtins(&mut natives);

    let connector = Arc::new(TransportConnector::new(config.gateway.connect_timeout()));
    Ok(Arc::new(Gateway::new(
        Registry::new(db.clone()),
        policy,
        CallLog::new(db),
        natives,
        ConnectionPool::new(connector),
        RetryPolicy::from(&config.gateway),
    )))
}

async fn serve(config: AppConfig, bind: Option<String>) -> Result<()> {
    let gateway = build_gateway(&config).await?;

    for manifest in config.servers.iter().cloned() {
        let name = manifest.name.clone();
        match gateway.register(manifest).await {
            Ok(registration) => match registration.sync_error {
                Some(e) => warn!("Server '{}' registered but tool discovery failed: {}", name, e),
                None => info!("Server '{}' ready with {} tools", name, registration.tools),
            },
            Err(e) => warn!("Failed to register server '{}' from config: {:#}", name, e),
        }
    }

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("toolgate v{} starting", env!("CARGO_PKG_VERSION"));
    GatewayServer::new(Arc::clone(&gateway), config.policy.admin_role.clone())
        .serve(listener, shutdown)
        .await?;

    gateway.close_all().await;
    info!("toolgate stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
        command => {
            let gateway = build_gateway(&config).await?;
            let result = run_admin(&gateway, command).await;
            gateway.close_all().await;
            result
        }
    }
}

async fn run_admin(gateway: &Gateway, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => Ok(()),
        Commands::Keys { action } => match action {
            KeyCommands::Create { name, role } => commands::create_key(gateway, &name, &role).await,
            KeyCommands::List => commands::list_keys(gateway).await,
            KeyCommands::Deactivate { id } => commands::deactivate_key(gateway, &id).await,
        },
        Commands::Servers { action } => match action {
            ServerCommands::Register { manifest } => {
                commands::register_server(gateway, &manifest).await
            }
            ServerCommands::Remove { name } => commands::remove_server(gateway, &name).await,
            ServerCommands::List => commands::list_servers(gateway).await,
        },
        Commands::Rules { action } => match action {
            RuleCommands::Add {
                role,
                resource,
                action,
            } => commands::add_rule(gateway, &role, &resource, &action).await,
            RuleCommands::Remove { role, resource } => {
                commands::remove_rule(gateway, &role, &resource).await
            }
            RuleCommands::List => commands::list_rules(gateway).await,
        },
        Commands::Stats => commands::stats(gateway).await,
        Commands::Logs { limit } => commands::logs(gateway, limit).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["toolgate", "keys", "create", "ci", "--role", "analyst"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Keys {
                action: KeyCommands::Create { ref name, ref role }
            } if name == "ci" && role == "analyst"
        ));

        let cli = Cli::try_parse_from(["toolgate", "logs"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { limit: 50 }));

        let cli = Cli::try_parse_from(["toolgate", "-c", "/tmp/tg.toml", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tg.toml")));
        assert!(matches!(cli.command, Commands::Serve { bind: Some(ref b) } if b == "0.0.0.0:9000"));

        let cli = Cli::try_parse_from(["toolgate", "servers", "remove", "research"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Servers {
                action: ServerCommands::Remove { ref name }
            } if name == "research"
        ));

        assert!(Cli::try_parse_from(["toolgate", "keys", "create", "ci"]).is_err());
    }

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.path = dir.join("toolgate.db");
        config.policy.bootstrap_admin_key = "tg_admin_cli_test".to_string();
        config
    }

    #[tokio::test]
    async fn test_build_gateway_seeds_admin_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let gateway = build_gateway(&config).await.unwrap();
        let admin = gateway
            .policy()
            .verify_api_key("tg_admin_cli_test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admin.role, "admin");
        drop(gateway);

        // Reopening the same database does not seed a second key
        let gateway = build_gateway(&config).await.unwrap();
        assert_eq!(gateway.policy().list_api_keys().await.unwrap().len(), 1);
        assert!(gateway.policy().can_access("admin", "any", "tool").await.unwrap());
    }

    #[tokio::test]
    async fn test_builtins_are_callable() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&config_in(dir.path())).await.unwrap();
        let tools = gateway.list_tools("admin").await.unwrap();
        assert!(tools.iter().any(|t| t.name == "echo"));
        assert!(tools.iter().any(|t| t.name == "utc_now"));
    }
}
