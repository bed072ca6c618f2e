use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for containers launched by a worker.
///
/// GPU devices come from the slot, not from here.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Path or name of the docker CLI
    pub docker_bin: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "16g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4" or "0.5")
    pub cpu_limit: Option<String>,
    /// Remove the container once its logs have been drained
    pub remove_after_exit: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            remove_after_exit: true,
        }
    }
}

/// Producer side of a job log.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// How often buffered output is pushed to the server
    pub flush_interval: Duration,
    /// Buffered bytes that force a flush before the next tick
    pub max_buffered_bytes: usize,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            max_buffered_bytes: 64 * 1024,
        }
    }
}

/// Server-side log files.
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub dir: PathBuf,
    /// Fallback re-check interval for followers waiting on new bytes
    pub follow_poll_interval: Duration,
    /// How long a full read waits for a log that does not exist yet
    pub missing_log_grace: Duration,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            follow_poll_interval: Duration::from_millis(250),
            missing_log_grace: Duration::from_secs(1),
        }
    }
}

impl LogStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// One concurrent execution context and the GPUs it may bind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotConfig {
    pub id: usize,
    pub gpus: Vec<String>,
}

impl SlotConfig {
    pub fn new(id: usize, gpus: Vec<String>) -> Self {
        Self { id, gpus }
    }

    /// Parse a comma-separated device list such as `0,1`. An empty string
    /// gives a slot without GPUs.
    pub fn parse(id: usize, devices: &str) -> Self {
        let gpus = devices
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        Self { id, gpus }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// gRPC endpoint of the server, e.g. `http://10.0.0.5:50051`
    pub server_url: String,
    pub token: String,
    /// Name reported with each claim, for server-side logs
    pub name: String,
    pub poll_interval: Duration,
    pub slots: Vec<SlotConfig>,
    pub container: ContainerConfig,
    pub log_writer: LogWriterConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:50051".to_string(),
            token: String::new(),
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(1),
            slots: vec![SlotConfig::default()],
            container: ContainerConfig::default(),
            log_writer: LogWriterConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_slot(mut self, gpus: &str) -> Self {
        let id = self.slots.len();
        self.slots.push(SlotConfig::parse(id, gpus));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub grpc_addr: SocketAddr,
    /// PostgreSQL connection string. `None` keeps jobs in memory.
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    pub tokens: Vec<String>,
    /// Per-request timeout for non-streaming HTTP endpoints
    pub request_timeout: Duration,
    pub logs: LogStoreConfig,
    /// Worker slots run inside the server process, talking to the store directly
    pub embedded_slots: Vec<SlotConfig>,
    pub poll_interval: Duration,
    pub container: ContainerConfig,
    pub log_writer: LogWriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: These are hardcoded valid addresses that will always parse
            http_addr: "127.0.0.1:8080"
                .parse()
                .expect("default http address is valid"),
            grpc_addr: "127.0.0.1:50051"
                .parse()
                .expect("default grpc address is valid"),
            database_url: None,
            max_db_connections: 10,
            tokens: Vec::new(),
            request_timeout: Duration::from_secs(15),
            logs: LogStoreConfig::default(),
            embedded_slots: Vec::new(),
            poll_interval: Duration::from_secs(1),
            container: ContainerConfig::default(),
            log_writer: LogWriterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }
}
