use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sharded_storage::client::ClientRouter;
use sharded_storage::config::ClusterConfig;
use sharded_storage::discovery::DiscoveryRegistry;
use sharded_storage::error::ClusterError;
use sharded_storage::master::{FileMapLog, MapLog, Master, MemoryMapLog};
use sharded_storage::node::NodeAgent;
use sharded_storage::shard::types::NodeId;
use sharded_storage::transport::MasterApi;
use sharded_storage::transport::http::{
    HttpDiscoveryClient, HttpMasterClient, HttpNodeClient, HttpTransport,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharded_storage", version, about = "Sharded key-value cluster")]
struct Cli {
    /// TOML config file. A missing file means defaults plus `SHARDKV__*` overrides.
    #[arg(long, global = true, env = "SHARDKV_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the Discovery registry.
    Discovery {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the Master coordinator.
    Master {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        shard_count: Option<u32>,
        #[arg(long)]
        commit_log: Option<String>,
    },
    /// Run a storage node.
    Node {
        #[arg(long)]
        id: Option<u64>,
        #[arg(long)]
        listen: Option<String>,
        /// Address other roles use to reach this node. Defaults to `--listen`.
        #[arg(long)]
        advertise: Option<String>,
    },
    /// Talk to a running cluster.
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    Get { key: String },
    Put { key: String, value: String },
    Delete { key: String },
    /// Bulk-load `key,value` lines from a file.
    Load { path: String },
    /// Print the current shard map.
    Map,
    /// Print the Master's status: members, tasks, alerts.
    Status,
    /// Move one shard to another node.
    Move { shard: u32, destination: u64 },
    /// Drain a node and remove it from the cluster.
    Decommission { node: u64 },
    Rebalance,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ClusterConfig::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.role {
        Role::Discovery { listen } => {
            if let Some(listen) = listen {
                config.discovery.listen = listen;
            }
            run_discovery(config).await
        }
        Role::Master {
            listen,
            shard_count,
            commit_log,
        } => {
            if let Some(listen) = listen {
                config.master.listen = listen;
            }
            if let Some(shard_count) = shard_count {
                config.master.shard_count = shard_count;
            }
            if commit_log.is_some() {
                config.master.commit_log = commit_log;
            }
            run_master(config).await
        }
        Role::Node {
            id,
            listen,
            advertise,
        } => {
            if let Some(id) = id {
                config.node.id = id;
            }
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            if advertise.is_some() {
                config.node.advertise = advertise;
            }
            run_node(config).await
        }
        Role::Client { action } => run_client(config, action).await,
    }
}

async fn serve(listen: &str, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    tracing::info!("Listening on {}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_discovery(config: ClusterConfig) -> anyhow::Result<()> {
    let registry = DiscoveryRegistry::new(config.discovery.clone());
    let _detector = registry.spawn_failure_detector();

    let app = sharded_storage::discovery::handlers::router(registry);
    serve(&config.discovery.listen, app).await
}

async fn run_master(config: ClusterConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::from_config(&config.cluster);
    let discovery = Arc::new(HttpDiscoveryClient::new(
        &config.cluster.discovery_url,
        transport.clone(),
    ));
    let nodes = Arc::new(HttpNodeClient::new(transport));

    let log: Arc<dyn MapLog> = match &config.master.commit_log {
        Some(path) => Arc::new(FileMapLog::open(path)?),
        None => {
            tracing::warn!("No commit log configured, the shard map will not survive a restart");
            Arc::new(MemoryMapLog::new())
        }
    };

    let master = Master::new(config.master.clone(), discovery, nodes, log)?;
    let _reconciler = master.run();

    let app = sharded_storage::master::handlers::router(master);
    serve(&config.master.listen, app).await
}

async fn run_node(config: ClusterConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::from_config(&config.cluster);
    let discovery = Arc::new(HttpDiscoveryClient::new(
        &config.cluster.discovery_url,
        transport.clone(),
    ));
    let master = Arc::new(HttpMasterClient::new(
        &config.cluster.master_url,
        transport.clone(),
    ));
    let peers = Arc::new(HttpNodeClient::new(transport));

    let agent = NodeAgent::new(
        NodeId(config.node.id),
        config.node.advertise_address(),
        config.node.clone(),
        discovery,
        master,
        peers,
    );

    // Listen first: the Master may call us as soon as we are registered.
    let listener = tokio::net::TcpListener::bind(&config.node.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.node.listen))?;
    let app = sharded_storage::node::handlers::router(agent.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    tracing::info!(node_id = config.node.id, "Node listening on {}", config.node.listen);

    loop {
        match agent.register().await {
            Ok(_) => break,
            Err(e @ ClusterError::AlreadyRegistered { .. }) => {
                tracing::error!(error = %e, "Registration rejected");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discovery unreachable, retrying registration");
                tokio::time::sleep(config.node.heartbeat_interval()).await;
            }
        }
    }

    let _loops = agent.start();
    server.await??;
    Ok(())
}

async fn run_client(config: ClusterConfig, action: ClientAction) -> anyhow::Result<()> {
    let transport = HttpTransport::from_config(&config.cluster);
    let master = Arc::new(HttpMasterClient::new(
        &config.cluster.master_url,
        transport.clone(),
    ));

    let connect = || {
        ClientRouter::connect(
            master.clone(),
            Arc::new(HttpNodeClient::new(transport.clone())),
            config.client.clone(),
        )
    };

    match action {
        ClientAction::Get { key } => match connect().await?.get(&key).await? {
            Some(value) => println!("{}", value),
            None => eprintln!("(not found)"),
        },
        ClientAction::Put { key, value } => {
            connect().await?.put(&key, &value).await?;
            println!("OK");
        }
        ClientAction::Delete { key } => {
            let existed = connect().await?.delete(&key).await?;
            println!("{}", if existed { "deleted" } else { "(not found)" });
        }
        ClientAction::Load { path } => {
            let router = connect().await?;
            let loaded = router.load_file(&path).await?;
            let stats = router.stats();
            println!(
                "loaded {} keys ({} redirects, {} retries)",
                loaded, stats.redirects, stats.retries
            );
        }
        ClientAction::Map => print_json(&master.get_shard_map().await?)?,
        ClientAction::Status => print_json(&master.status().await?)?,
        ClientAction::Move { shard, destination } => {
            let task_id = master.move_shard(shard, NodeId(destination)).await?;
            println!("{}", task_id);
        }
        ClientAction::Decommission { node } => {
            master.decommission(NodeId(node)).await?;
            println!("draining {}", NodeId(node));
        }
        ClientAction::Rebalance => {
            for task_id in master.rebalance().await? {
                println!("{}", task_id);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
