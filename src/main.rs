use clap::{Args, Parser, Subcommand};
use maasd::handler::{build_tls_acceptor, run_request_handler_server, TlsSettings};
use maasd::job::JobManager;
use maasd::kv::{KeyNamespace, KvConfig, KvStore};
use maasd::model::ModelRegistry;
use maasd::resource::{Resource, ResourceManager};
use maasd::scheduler::{
    serve_scheduler_rpc, DockerClient, ImageDomainConfig, Scheduler, SchedulerConfig,
};
use maasd::{PermissiveAuth, RequestHandler, SchedulerClient, SessionManagerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tracing::{error, info};
use url::Url;

/// Exit code for errors during service startup.
const EXIT_STARTUP_FAILURE: i32 = 1;
/// Exit code for unrecoverable runtime errors.
const EXIT_RUNTIME_FAILURE: i32 = 255;

#[derive(Debug, Parser)]
#[command(name = "maasd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model-as-a-Service control plane services")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every service.
#[derive(Debug, Args)]
struct ServiceArgs {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Directory holding certificate.pem and privkey.pem for TLS
    #[arg(long = "ssl-dir")]
    ssl_dir: Option<PathBuf>,
    /// TLS certificate file (overrides --ssl-dir)
    #[arg(long)]
    cert: Option<PathBuf>,
    /// TLS private key file (overrides --ssl-dir)
    #[arg(long)]
    key: Option<PathBuf>,
    /// KV store host (defaults to environment or "redis")
    #[arg(long = "redis-host")]
    redis_host: Option<String>,
    /// KV store port
    #[arg(long = "redis-port")]
    redis_port: Option<u16>,
    /// KV store password
    #[arg(long = "redis-pass")]
    redis_pass: Option<String>,
    /// Process-wide key namespace prefix
    #[arg(long = "key-prefix", default_value = "maas")]
    key_prefix: String,
    /// Use the embedded in-memory store instead of redis (single-process
    /// development deployments)
    #[arg(long = "embedded-store")]
    embedded_store: bool,
}

impl ServiceArgs {
    fn kv_config(&self) -> KvConfig {
        let mut config = KvConfig::from_env();
        if let Some(host) = &self.redis_host {
            config.host = host.clone();
        }
        if let Some(port) = self.redis_port {
            config.port = port;
        }
        if let Some(password) = &self.redis_pass {
            config.password = Some(password.clone());
        }
        config
    }

    async fn open_store(&self) -> Result<KvStore, String> {
        if self.embedded_store {
            return Ok(KvStore::in_memory());
        }
        KvStore::connect(self.kv_config())
            .await
            .map_err(|err| format!("could not reach the KV store: {err}"))
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, String> {
        match TlsSettings::resolve(
            self.ssl_dir.as_deref(),
            self.cert.as_deref(),
            self.key.as_deref(),
        ) {
            Some(settings) => build_tls_acceptor(&settings)
                .map(Some)
                .map_err(|err| format!("TLS setup failed: {err}")),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the websocket request handler
    RequestHandler {
        #[command(flatten)]
        service: ServiceArgs,
        /// Port to listen on
        #[arg(long, default_value_t = 3012)]
        port: u16,
        /// Scheduler RPC host
        #[arg(long = "scheduler-host", default_value = "localhost")]
        scheduler_host: String,
        /// Scheduler RPC port
        #[arg(long = "scheduler-port", default_value_t = 3013)]
        scheduler_port: u16,
        /// Session inactivity timeout in seconds
        #[arg(long = "session-timeout-secs", default_value_t = 1800)]
        session_timeout_secs: u64,
        /// Resource pool whose jobs this handler serves
        #[arg(long = "resource-pool", default_value = "maas")]
        resource_pool: String,
    },
    /// Run the scheduler service
    Scheduler {
        #[command(flatten)]
        service: ServiceArgs,
        /// Port to listen on for scheduler RPC
        #[arg(long, default_value_t = 3013)]
        port: u16,
        /// JSON file listing the worker-node pool
        #[arg(long = "resource-list")]
        resource_list: Option<PathBuf>,
        /// JSON file mapping models to images and domains to data dirs
        #[arg(long = "images-and-domains")]
        images_and_domains: Option<PathBuf>,
        /// Resource pool served by this scheduler
        #[arg(long = "resource-pool", default_value = "maas")]
        resource_pool: String,
        /// Seconds between monitor passes
        #[arg(long = "monitor-interval-secs", default_value_t = 5)]
        monitor_interval_secs: u64,
        /// Service recreate attempts before a job is failed
        #[arg(long = "restart-budget", default_value_t = 2)]
        restart_budget: u32,
        /// Directory for per-job SSH key pairs
        #[arg(long = "keys-dir", default_value = "/var/lib/maasd/keys")]
        keys_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maasd=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::RequestHandler {
            service,
            port,
            scheduler_host,
            scheduler_port,
            session_timeout_secs,
            resource_pool,
        } => {
            run_request_handler(
                service,
                port,
                scheduler_host,
                scheduler_port,
                session_timeout_secs,
                resource_pool,
            )
            .await
        }
        Command::Scheduler {
            service,
            port,
            resource_list,
            images_and_domains,
            resource_pool,
            monitor_interval_secs,
            restart_budget,
            keys_dir,
        } => {
            run_scheduler(
                service,
                port,
                resource_list,
                images_and_domains,
                resource_pool,
                monitor_interval_secs,
                restart_budget,
                keys_dir,
            )
            .await
        }
    };
    std::process::exit(code);
}

async fn run_request_handler(
    service: ServiceArgs,
    port: u16,
    scheduler_host: String,
    scheduler_port: u16,
    session_timeout_secs: u64,
    resource_pool: String,
) -> i32 {
    info!("starting request handler");

    let store = match service.open_store().await {
        Ok(store) => store,
        Err(err) => {
            error!("{err}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    let tls = match service.tls_acceptor() {
        Ok(tls) => tls,
        Err(err) => {
            error!("{err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let keys = KeyNamespace::new(&service.key_prefix);
    let sessions = maasd::SessionManager::new(
        store.clone(),
        keys.clone(),
        SessionManagerConfig {
            timeout: chrono::Duration::seconds(session_timeout_secs as i64),
        },
    );
    let resources = ResourceManager::new(store.clone(), keys.clone());
    let jobs = JobManager::new(store, keys, resource_pool, resources);

    let scheduler_url = format!("ws://{scheduler_host}:{scheduler_port}/");
    let scheduler_url = match Url::parse(&scheduler_url) {
        Ok(url) => url,
        Err(err) => {
            error!("invalid scheduler endpoint {scheduler_url}: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    let scheduler = Arc::new(SchedulerClient::new(scheduler_url));

    let handler = Arc::new(RequestHandler::new(
        sessions,
        jobs,
        scheduler,
        Arc::new(PermissiveAuth),
        ModelRegistry::with_defaults(),
    ));

    let bind = format!("{}:{}", service.host, port);
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("could not bind {bind}: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    match run_request_handler_server(handler, listener, tls).await {
        Ok(()) => 0,
        Err(err) => {
            error!("request handler terminated: {err}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler(
    service: ServiceArgs,
    port: u16,
    resource_list: Option<PathBuf>,
    images_and_domains: Option<PathBuf>,
    resource_pool: String,
    monitor_interval_secs: u64,
    restart_budget: u32,
    keys_dir: PathBuf,
) -> i32 {
    info!("starting scheduler");

    let store = match service.open_store().await {
        Ok(store) => store,
        Err(err) => {
            error!("{err}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    let tls = match service.tls_acceptor() {
        Ok(tls) => tls,
        Err(err) => {
            error!("{err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let keys = KeyNamespace::new(&service.key_prefix);
    let resources = ResourceManager::new(store.clone(), keys.clone());
    if let Some(path) = resource_list {
        let pool = match load_resource_list(&path) {
            Ok(pool) => pool,
            Err(err) => {
                error!("{err}");
                return EXIT_STARTUP_FAILURE;
            }
        };
        if let Err(err) = resources.set_resources(pool).await {
            error!("could not register resources: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    }

    let images = match images_and_domains {
        Some(path) => match ImageDomainConfig::from_file(&path) {
            Ok(images) => images,
            Err(err) => {
                error!("{err}");
                return EXIT_STARTUP_FAILURE;
            }
        },
        None => ImageDomainConfig::default(),
    };

    let docker = match DockerClient::connect().await {
        Ok(docker) => docker,
        Err(err) => {
            error!("container engine unavailable: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let jobs = JobManager::new(store, keys, resource_pool.clone(), resources.clone());
    let scheduler = Scheduler::new(
        docker,
        images,
        resources,
        jobs,
        SchedulerConfig {
            resource_pool,
            monitor_interval: Duration::from_secs(monitor_interval_secs),
            restart_budget,
            keys_dir,
            ..SchedulerConfig::default()
        },
    );
    let monitor = scheduler.spawn_monitor();

    let bind = format!("{}:{}", service.host, port);
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("could not bind {bind}: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let outcome = serve_scheduler_rpc(scheduler, listener, tls).await;
    monitor.abort();
    match outcome {
        Ok(()) => 0,
        Err(err) => {
            error!("scheduler terminated: {err}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

fn load_resource_list(path: &std::path::Path) -> Result<Vec<Resource>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read resource list {}: {err}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|err| format!("invalid resource list {}: {err}", path.display()))
}
