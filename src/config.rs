use crate::error::AppError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9898;
pub const DEFAULT_ROOT: &str = "./static";
pub const DEFAULT_THREADS: usize = 64;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_KEEP_ALIVE_REQUESTS: usize = 1000;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_INDEX_FILE: &str = "index.html";
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Smallest header limit that still fits a realistic request line.
const MIN_HEADER_SIZE: usize = 256;

/// Process-wide server settings. Built once at startup, then shared read-only.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "static-server",
    version,
    about = "A concurrent static file server with keep-alive, range requests and conditional GETs.",
    long_about = "Serves files from a document root over HTTP/1.1.\n\
        Every option can also be set through the environment variable shown next to it;\n\
        with no arguments the server listens on 127.0.0.1:9898 and serves ./static.\n\
        Log verbosity follows RUST_LOG (error, warn, info, debug, trace)."
)]
pub struct ServerConfig {
    /// Host address to listen on (e.g. "127.0.0.1", "0.0.0.0")
    #[arg(short, long, env = "STATIC_SERVER_HOST", default_value = DEFAULT_HOST)]
    pub listen: String,

    /// Port number to listen on (0 picks a free port)
    #[arg(short, long, env = "STATIC_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Document root; every served file must resolve beneath it
    #[arg(short, long, env = "STATIC_SERVER_ROOT", default_value = DEFAULT_ROOT)]
    pub directory: PathBuf,

    /// Number of worker threads that connections are multiplexed over
    #[arg(short, long, env = "STATIC_SERVER_THREADS", default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    /// Maximum number of simultaneously open client connections
    #[arg(long, env = "STATIC_SERVER_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Seconds an idle keep-alive connection is held open
    #[arg(long, env = "STATIC_SERVER_KEEP_ALIVE_TIMEOUT", default_value_t = DEFAULT_KEEP_ALIVE_TIMEOUT_SECS)]
    pub keep_alive_timeout: u64,

    /// Seconds allowed to receive a complete request head, from its first byte
    #[arg(long, env = "STATIC_SERVER_REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Seconds a response may go without the client accepting any bytes before the connection is dropped
    #[arg(long, env = "STATIC_SERVER_WRITE_TIMEOUT", default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    pub write_timeout: u64,

    /// Requests served on one connection before it is closed
    #[arg(long, env = "STATIC_SERVER_MAX_KEEP_ALIVE_REQUESTS", default_value_t = DEFAULT_MAX_KEEP_ALIVE_REQUESTS)]
    pub max_keep_alive_requests: usize,

    /// Maximum size in bytes of a request line plus headers
    #[arg(long, env = "STATIC_SERVER_MAX_HEADER_SIZE", default_value_t = DEFAULT_MAX_HEADER_SIZE)]
    pub max_header_size: usize,

    /// Buffer size used when streaming file bodies
    #[arg(short, long, env = "STATIC_SERVER_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// File served when a directory is requested
    #[arg(long, env = "STATIC_SERVER_INDEX_FILE", default_value = DEFAULT_INDEX_FILE)]
    pub index_file: String,

    /// Maximum number of entries kept in the file metadata cache
    #[arg(long, env = "STATIC_SERVER_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Refuse files larger than this many bytes with 413
    #[arg(long, env = "STATIC_SERVER_MAX_FILE_SIZE")]
    pub max_file_size: Option<u64>,

    /// Glob patterns (comma-separated, matched against the request path) answered with 403
    #[arg(long, env = "STATIC_SERVER_DENY", value_delimiter = ',')]
    pub deny: Vec<String>,

    /// Log filter in RUST_LOG syntax
    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Also append every log line to this file
    #[arg(long, env = "STATIC_SERVER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            directory: PathBuf::from(DEFAULT_ROOT),
            threads: DEFAULT_THREADS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT_SECS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
            write_timeout: DEFAULT_WRITE_TIMEOUT_SECS,
            max_keep_alive_requests: DEFAULT_MAX_KEEP_ALIVE_REQUESTS,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            index_file: DEFAULT_INDEX_FILE.to_string(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_file_size: None,
            deny: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    /// A zero setting disables the timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout > 0).then(|| Duration::from_secs(self.request_timeout))
    }

    /// A zero setting disables the timeout.
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout > 0).then(|| Duration::from_secs(self.write_timeout))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.threads == 0 {
            return Err(AppError::InvalidConfig("threads must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(AppError::InvalidConfig(
                "max-connections must be at least 1".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(AppError::InvalidConfig("chunk-size must be at least 1".into()));
        }
        if self.max_header_size < MIN_HEADER_SIZE {
            return Err(AppError::InvalidConfig(format!(
                "max-header-size must be at least {MIN_HEADER_SIZE} bytes"
            )));
        }
        if self.index_file.is_empty() || self.index_file.contains('/') {
            return Err(AppError::InvalidConfig(
                "index-file must be a plain file name".into(),
            ));
        }
        Ok(())
    }
}
