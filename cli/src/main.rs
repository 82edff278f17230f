// ptt: command-line node for the entity framework
//
// `ptt start` runs a node and serves the local RPC. The other subcommands
// either work on the local config and store or talk to that running node.

mod config;
mod node;
mod rpc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use node::Node;
use ptt_core::store::Db;
use ptt_core::transport::node_id_to_peer_id;
use ptt_core::MyInfo;
use rpc::{Control, RpcContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ptt")]
#[command(about = "Ptt: peer-to-peer entities with signed membership logs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the node identity
    Init {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Run the node and its local RPC
    Start {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        rpc_port: Option<u16>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print an invitation, creating the entity when given a name
    Invite {
        /// Existing entity id
        #[arg(short, long)]
        entity: Option<String>,
        /// Name of a new entity
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Join an entity through an invitation
    Join {
        invitation: String,
        /// Inviter address, /ip4/../tcp/../p2p/<peer id>
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// Call an RPC method on the running node
    Rpc {
        method: String,
        /// JSON params
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config)?;

    match cli.command {
        Commands::Init { name } => cmd_init(config, name),
        Commands::Start { port, rpc_port } => cmd_start(config, port, rpc_port).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Invite { entity, name } => cmd_invite(&config, entity, name).await,
        Commands::Join { invitation, addr } => cmd_join(&config, invitation, addr).await,
        Commands::Rpc { method, params } => cmd_rpc(&config, &method, params).await,
    }
}

/// Stderr logs, JSON when configured, plus an optional daily file.
/// The returned guard flushes the file writer on drop.
fn init_logging(config: &config::Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = if config.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "ptt.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install logger")?;
    Ok(guard)
}

fn open_store(config: &config::Config) -> Result<Db> {
    let path = config.data_dir()?.join("store");
    let path = path.to_str().context("Store path is not valid UTF-8")?;
    Db::sled(path).context("Failed to open store")
}

fn cmd_init(mut config: config::Config, name: Option<String>) -> Result<()> {
    println!("{}", "Initializing ptt...".bold());
    println!();

    if let Some(name) = name {
        config.name = name;
        config.save()?;
    }
    println!("  {} Configuration: {}", "✓".green(), config::Config::config_file()?.display());

    let db = open_store(&config)?;
    let my_info = MyInfo::load_or_create(&db, &config.name).context("Failed to initialize identity")?;
    println!("  {} Data directory: {}", "✓".green(), config.data_dir()?.display());
    println!();

    print_identity(&my_info)?;
    println!();
    println!("{}", "Next steps:".bold());
    println!("  • Start node:     {}", "ptt start".bright_green());
    println!("  • Invite members: {}", "ptt invite --name <entity>".bright_green());
    Ok(())
}

fn print_identity(my_info: &MyInfo) -> Result<()> {
    println!("{}", "Identity:".bold());
    println!("  Name:    {}", my_info.name.bright_cyan());
    println!("  User ID: {}", my_info.user_id.to_string().bright_cyan());
    println!("  Node ID: {}", my_info.node_id.to_string().bright_yellow());
    println!("  Peer ID: {}", node_id_to_peer_id(&my_info.node_id)?);
    Ok(())
}

async fn cmd_start(mut config: config::Config, port: Option<u16>, rpc_port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.listen_port = port;
    }
    let rpc_port = rpc_port.unwrap_or(config.rpc_port);
    let db = open_store(&config)?;
    let my_info = MyInfo::load_or_create(&db, &config.name).context("Failed to load identity")?;

    println!("{}", "Starting ptt...".bold());
    println!();
    print_identity(&my_info)?;
    println!();

    let (control, mut control_rx) = mpsc::channel(4);
    let ctx = Arc::new(RpcContext {
        node: RwLock::new(None),
        control: control.clone(),
    });
    let server = rpc::serve(rpc_port, ctx.clone());
    println!("{} RPC on 127.0.0.1:{}", "✓".green(), rpc_port);

    let ctrl_c = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c.send(Control::Shutdown).await;
        }
    });

    let mut my_info = Some(my_info);
    loop {
        let identity = match my_info.take() {
            Some(identity) => identity,
            None => MyInfo::load(&db)?.context("Identity missing from store")?,
        };
        let node = Arc::new(Node::start(&config, db.clone(), identity).await?);
        println!("{} Node started with {} entities", "✓".green(), node.ptt.entities().len());
        *ctx.node.write().await = Some(node.clone());

        let next = control_rx.recv().await.unwrap_or(Control::Shutdown);
        ctx.node.write().await.take();
        node.stop().await;

        match next {
            Control::Restart => {
                info!("restarting node");
                println!("{} Restarting...", "↻".bright_yellow());
            }
            Control::Shutdown => break,
        }
    }

    server.abort();
    if let Err(e) = db.flush() {
        warn!("final flush: {}", e);
    }
    println!("Shut down.");
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
    }
    Ok(())
}

async fn cmd_invite(config: &config::Config, entity: Option<String>, name: Option<String>) -> Result<()> {
    let result = rpc::call(
        config.rpc_port,
        "invite",
        json!({ "entity_id": entity, "name": name }),
    )
    .await?;

    let field = |key: &str| result.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    println!("{}", "Invitation".bold());
    println!("  Entity: {}", field("entity_id").bright_cyan());
    println!("  Node:   {}", field("peer_id").bright_yellow());
    println!();
    println!("{}", field("invitation"));
    println!();
    println!(
        "Share it with: {}",
        "ptt join <invitation> --addr /ip4/<host>/tcp/<port>/p2p/<node>".bright_green()
    );
    Ok(())
}

async fn cmd_join(config: &config::Config, invitation: String, addr: Option<String>) -> Result<()> {
    let result = rpc::call(
        config.rpc_port,
        "join",
        json!({ "invitation": invitation, "addr": addr }),
    )
    .await?;
    let entity_id = result.get("entity_id").and_then(Value::as_str).unwrap_or_default();
    println!("{} Join requested for {}", "✓".green(), entity_id.bright_cyan());
    println!("  It completes once the inviter is reachable; check with {}", "ptt rpc list_entities".bright_green());
    Ok(())
}

async fn cmd_rpc(config: &config::Config, method: &str, params: Option<String>) -> Result<()> {
    let params = match params {
        Some(text) => serde_json::from_str(&text).context("Params must be JSON")?,
        None => Value::Null,
    };
    let result = rpc::call(config.rpc_port, method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
