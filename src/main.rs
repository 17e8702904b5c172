//! HwameiStor node engine
//!
//! Runs on every storage node: disk inventory and health, pool
//! management, replica reconciliation with DRBD replication, plus the
//! optional admission webhook and the leader-elected cluster
//! collaborators (evictor, disk actions).

use anyhow::Context;
use clap::Parser;
use futures::{Future, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hwameistor_node::config::parse_disk_class;
use hwameistor_node::crd::{LocalDisk, LocalDiskAction, LocalDiskClaim, LocalVolumeMigrate};
use hwameistor_node::storage::parse_bytes;
use hwameistor_node::webhook::{run_webhook_server, FailurePolicy, MutateConfig};
use hwameistor_node::{
    BasicExecutor, DiskActionController, DiskClaimBinder, DiskClass, DiskExecutor, DiskInventory,
    DrbdConfigurator, EventPump, Evictor, Executor, HealthManager, KubeStore, LeaderElector,
    LocalRegistry, LocalVolumeReplica, LuksManager, LvmExecutor, NodeAgent, NodeConfig,
    NodeMetrics, NodeStatusPublisher, NsExecutor, ObjectStore, PodMutator, PoolManager,
    RamExecutor, ReplicaExecutor, ReplicaManager, ReplicaReconciler, SmartctlClient, SystemConfig,
    TaskQueue,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HwameiStor node engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of this Kubernetes node
    #[arg(long, env = "MY_NODENAME", default_value = "")]
    node_name: String,

    /// Pod name, used as the leader election identity
    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,

    /// Namespace holding the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "hwameistor")]
    namespace: String,

    /// IP used for DRBD replication traffic
    #[arg(long, env = "STORAGE_IP", default_value = "")]
    storage_ip: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:80")]
    metrics_addr: SocketAddr,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:18443")]
    webhook_addr: SocketAddr,

    /// Directory holding tls.crt and tls.key for the webhook
    #[arg(long, env = "CERT_DIR", default_value = "/etc/webhook/certs")]
    cert_dir: PathBuf,

    /// Scheduler assigned to pods with HwameiStor volumes
    #[arg(long, env = "SCHEDULER_NAME", default_value = "hwameistor-scheduler")]
    scheduler_name: String,

    /// What the webhook does when a referenced object is missing
    #[arg(long, env = "FAILURE_POLICY", value_enum, ignore_case = true, default_value = "ignore")]
    failure_policy: FailurePolicy,

    /// Image of the dataset loader init container
    #[arg(long, env = "DATALOADER_IMAGE", default_value = "")]
    dataloader_image: String,

    /// Declared size of the RAM pool (e.g. 4Gi)
    #[arg(long, env = "RAM_DISK_TOTAL_CAPACITY", value_parser = parse_bytes, default_value = "0")]
    ram_disk_total_capacity: i64,

    /// Disk class whose pool uses whole disks instead of LVM (repeatable)
    #[arg(long = "raw-disk-class", env = "RAW_DISK_CLASSES", value_delimiter = ',', value_parser = parse_disk_class)]
    raw_disk_classes: Vec<DiskClass>,

    /// First TCP port of DRBD resources
    #[arg(long, env = "DRBD_START_PORT", default_value = "43001")]
    drbd_start_port: i64,

    /// Seconds between disk health checks
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value = "1800")]
    health_check_interval: u64,

    /// Seconds between node syncs
    #[arg(long, env = "SYNC_INTERVAL", default_value = "60")]
    sync_interval: u64,

    /// Serve the pod admission webhook
    #[arg(long, env = "ENABLE_WEBHOOK")]
    enable_webhook: bool,

    /// Run the evictor while holding the leader lease
    #[arg(long, env = "ENABLE_EVICTOR")]
    enable_evictor: bool,

    /// Run the disk action controller while holding the leader lease
    #[arg(long, env = "ENABLE_DISK_ACTION")]
    enable_disk_action: bool,

    /// Print the CRDs as YAML and exit
    #[arg(long)]
    print_crds: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn configs(&self) -> (NodeConfig, SystemConfig) {
        let mut node = NodeConfig {
            node_name: self.node_name.clone(),
            storage_ip: self.storage_ip.clone(),
            ram_disk_total_capacity: self.ram_disk_total_capacity,
            raw_disk_classes: self.raw_disk_classes.clone(),
            ..Default::default()
        };
        node.drbd.start_port = self.drbd_start_port;
        node.health.interval = Duration::from_secs(self.health_check_interval);
        node.agent.sync_interval = Duration::from_secs(self.sync_interval);

        let mut system = SystemConfig {
            metrics_addr: self.metrics_addr,
            health_addr: self.health_addr,
            mutate: MutateConfig {
                scheduler_name: self.scheduler_name.clone(),
                failure_policy: self.failure_policy,
                dataloader_image: self.dataloader_image.clone(),
            },
            enable_webhook: self.enable_webhook,
            enable_evictor: self.enable_evictor,
            enable_disk_action: self.enable_disk_action,
            ..Default::default()
        };
        system.webhook.addr = self.webhook_addr;
        system.webhook.cert_dir = self.cert_dir.clone();
        system.leader.identity = self.pod_name.clone();
        system.leader.namespace = self.namespace.clone();
        (node, system)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", hwameistor_node::crd::crds_yaml()?);
        return Ok(());
    }

    init_logging(&args);

    let (node_config, system_config) = args.configs();
    node_config.validate()?;
    system_config.validate()?;
    let node = node_config.node_name.clone();

    info!("Starting HwameiStor node engine");
    info!("  Version: {}", hwameistor_node::VERSION);
    info!("  Node: {}", node);
    info!("  Raw disk classes: {:?}", node_config.raw_disk_classes);
    info!("  Webhook: {}", system_config.enable_webhook);
    info!("  Evictor: {}", system_config.enable_evictor);
    info!("  Disk actions: {}", system_config.enable_disk_action);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let exec: Arc<dyn Executor> = Arc::new(NsExecutor::new(BasicExecutor::new()));

    // Storage backends
    let registry = LocalRegistry::new(node.clone());
    let lvm = Arc::new(LvmExecutor::new(node.clone(), exec.clone()));
    let disk = Arc::new(DiskExecutor::new(
        node.clone(),
        exec.clone(),
        node_config.dev_root.clone(),
        node_config.raw_disk_classes.clone(),
    ));
    let ram = Arc::new(RamExecutor::new(
        node.clone(),
        exec.clone(),
        node_config.ram_pool_path.clone(),
        node_config.ram_disk_total_capacity,
    ));
    let luks = Arc::new(LuksManager::new(exec.clone(), node_config.key_dir.clone()));
    let manager = Arc::new(
        ReplicaManager::new(registry.clone())
            .with_executor(lvm.clone())
            .with_executor(disk.clone())
            .with_executor(ram.clone())
            .with_luks(luks.clone()),
    );
    let executors: Vec<Arc<dyn ReplicaExecutor>> = vec![lvm.clone(), disk.clone(), ram.clone()];
    let pools = PoolManager::new(registry.clone(), executors, node_config.raw_disk_classes.clone());

    // Node components
    let inventory = Arc::new(DiskInventory::new(node_config.scanner.clone(), exec.clone()));
    let drbd = Arc::new(DrbdConfigurator::new(node.clone(), exec.clone(), node_config.drbd.clone()));
    let publisher = Arc::new(NodeStatusPublisher::new(node.clone(), store.clone(), registry.clone()));
    let agent = Arc::new(
        NodeAgent::new(
            node.clone(),
            store.clone(),
            inventory.clone(),
            pools,
            manager.clone(),
            publisher.clone(),
            node_config.agent.clone(),
        )
        .with_lvm(lvm.clone())
        .with_drbd(drbd.clone()),
    );
    let reconciler = Arc::new(
        ReplicaReconciler::new(
            node.clone(),
            store.clone(),
            manager.clone(),
            publisher.clone(),
            TaskQueue::new("replicas", 0),
        )
        .with_drbd(drbd.clone())
        .with_luks(luks.clone()),
    );
    let pump = EventPump::new();
    let health = Arc::new(HealthManager::new(
        node.clone(),
        inventory.clone(),
        SmartctlClient::new(exec.clone()),
        store.clone(),
        node_config.health.clone(),
    ));
    let metrics = Arc::new(
        NodeMetrics::new(node.clone(), registry.clone(), store.clone())?.with_health(health.clone()),
    );
    let claims = Arc::new(DiskClaimBinder::new(node.clone(), store.clone()));

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Servers
    {
        let token = token.clone();
        let addr = system_config.health_addr;
        tasks.spawn(async move {
            if let Err(e) = run_health_server(addr, token).await {
                error!("Health server error: {}", e);
            }
        });
    }
    {
        let token = token.clone();
        let addr = system_config.metrics_addr;
        let metrics = metrics.clone();
        tasks.spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, token).await {
                error!("Metrics server error: {}", e);
            }
        });
    }
    if system_config.enable_webhook {
        let mutator = Arc::new(PodMutator::new(store.clone(), system_config.mutate.clone()));
        let config = system_config.webhook.clone();
        let token = token.clone();
        // Missing certificates abort startup
        hwameistor_node::webhook::server::cert_paths(&config.cert_dir)?;
        tasks.spawn(async move {
            if let Err(e) = run_webhook_server(config, mutator, token.clone()).await {
                error!("Admission webhook error: {}", e);
                token.cancel();
            }
        });
    }

    // Node loops
    {
        let (agent, token) = (agent.clone(), token.clone());
        tasks.spawn(async move { agent.run(token).await });
    }
    {
        let (reconciler, token) = (reconciler.clone(), token.clone());
        tasks.spawn(async move { reconciler.run(token).await });
    }
    {
        let (reconciler, token, events) = (reconciler.clone(), token.clone(), pump.subscribe());
        tasks.spawn(async move { reconciler.watch_ha_events(events, token).await });
    }
    {
        let (pump, token) = (pump.clone(), token.clone());
        tasks.spawn(async move { pump.run(token).await });
    }
    {
        let (health, token) = (health.clone(), token.clone());
        tasks.spawn(async move { health.run(token).await });
    }
    {
        let (claims, token) = (claims.clone(), token.clone());
        tasks.spawn(async move { claims.run(token).await });
    }

    // Watches
    {
        let reconciler = reconciler.clone();
        let node = node.clone();
        tasks.spawn(watch(
            Api::<LocalVolumeReplica>::all(client.clone()),
            token.clone(),
            move |r: &LocalVolumeReplica| {
                if r.spec.node_name == node {
                    reconciler.queue().add(r.name_any());
                }
            },
        ));
    }
    {
        let claims = claims.clone();
        let node = node.clone();
        tasks.spawn(watch(
            Api::<LocalDiskClaim>::all(client.clone()),
            token.clone(),
            move |c: &LocalDiskClaim| {
                if c.spec.node_name == node {
                    claims.queue().add(c.name_any());
                }
            },
        ));
    }

    // Leader-only collaborators
    if system_config.needs_leader() {
        let elector = LeaderElector::new(client.clone(), system_config.leader.clone());
        let client = client.clone();
        let store = store.clone();
        let system = system_config.clone();
        let token = token.clone();
        tasks.spawn(async move {
            elector
                .run(token, move |lead| {
                    run_leader_tasks(client.clone(), store.clone(), system.clone(), lead)
                })
                .await
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = token.cancelled() => warn!("Shutting down after a fatal error"),
    }
    token.cancel();
    reconciler.queue().shutdown();
    claims.queue().shutdown();

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(system_config.shutdown_grace, drain).await.is_err() {
        warn!("Tasks did not stop within {:?}", system_config.shutdown_grace);
    }

    info!("Node engine shutdown complete");
    Ok(())
}

/// Collaborators that run while the lease is held
async fn run_leader_tasks(
    client: Client,
    store: Arc<dyn ObjectStore>,
    system: SystemConfig,
    lead: CancellationToken,
) {
    let mut tasks = JoinSet::new();

    if system.enable_evictor {
        let evictor = Arc::new(Evictor::new(store.clone()));
        {
            let (evictor, lead) = (evictor.clone(), lead.clone());
            tasks.spawn(async move { evictor.run(lead).await });
        }
        {
            let evictor = evictor.clone();
            tasks.spawn(watch(Api::<Node>::all(client.clone()), lead.clone(), move |n: &Node| {
                evictor.enqueue_node(&n.name_any())
            }));
        }
        tasks.spawn(watch(
            Api::<LocalVolumeMigrate>::all(client.clone()),
            lead.clone(),
            move |m: &LocalVolumeMigrate| evictor.enqueue_migrate(&m.name_any()),
        ));
    }

    if system.enable_disk_action {
        let actions = Arc::new(DiskActionController::new(store.clone()));
        {
            let (actions, lead) = (actions.clone(), lead.clone());
            tasks.spawn(async move { actions.run(lead).await });
        }
        {
            let actions = actions.clone();
            tasks.spawn(watch(Api::<LocalDisk>::all(client.clone()), lead.clone(), move |d: &LocalDisk| {
                actions.enqueue_disk(&d.name_any())
            }));
        }
        tasks.spawn(watch(
            Api::<LocalDiskAction>::all(client.clone()),
            lead.clone(),
            move |a: &LocalDiskAction| actions.enqueue_action(&a.name_any()),
        ));
    }

    lead.cancelled().await;
    while tasks.join_next().await.is_some() {}
}

/// Feed every touched object to `handle` until cancelled
fn watch<K, F>(api: Api<K>, token: CancellationToken, handle: F) -> impl Future<Output = ()> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default,
    F: Fn(&K) + Send + 'static,
{
    async move {
        let kind = K::kind(&Default::default()).to_string();
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .touched_objects();
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.try_next() => match item {
                    Ok(Some(obj)) => handle(&obj),
                    Ok(None) => break,
                    Err(e) => warn!("{} watch error: {}", kind, e),
                },
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "rustls=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, token: CancellationToken) -> hwameistor_node::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| hwameistor_node::Error::Configuration(format!("health server bind: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| hwameistor_node::Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<NodeMetrics>,
    token: CancellationToken,
) -> hwameistor_node::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.render().await {
                            Ok(text) => {
                                let mut response = text_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| hwameistor_node::Error::Configuration(format!("metrics server bind: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| hwameistor_node::Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
