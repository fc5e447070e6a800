use crate::cache::MetadataCache;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::fs::{prepare_document_root, FileResolver};
use crate::http::{handle_client, ConnectionContext};
use crate::parser::RequestParser;
use crate::response::{HttpResponse, StatusCode};
use log::{debug, error, info, warn};
use rand::Rng;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use threadpool::ThreadPool;

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything connection tasks share. Only the cache mutates after startup.
pub struct ServerState {
    pub config: ServerConfig,
    pub resolver: FileResolver,
    pub cache: MetadataCache,
    pub parser: RequestParser,
    pub shutdown: Arc<AtomicBool>,
    active_connections: AtomicUsize,
}

impl ServerState {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Counts one open connection; released when the connection is dropped.
pub struct ConnectionSlot {
    state: Arc<ServerState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Starts a graceful shutdown from any thread.
///
/// The accept loop blocks in `accept`, so triggering also opens a throwaway
/// connection to the listener to wake it.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_CONNECT_TIMEOUT) {
            debug!("Could not wake the accept loop at {}: {e}", self.wake_addr);
        }
    }
}

/// Owns the listening socket and the worker pool.
///
/// Shutdown is always a graceful drain: accepting stops, idle keep-alive
/// connections close at their next poll, in-flight responses are finished
/// with `Connection: close`, and `run` returns once every worker is idle.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    pool: ThreadPool,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self, AppError> {
        config.validate()?;
        prepare_document_root(&config.directory, &config.index_file)?;
        let resolver = FileResolver::new(&config)?;

        let listener = TcpListener::bind(config.bind_address())?;
        let local_addr = listener.local_addr()?;

        let pool = threadpool::Builder::new()
            .num_threads(config.threads)
            .thread_name("static-server-worker".to_string())
            .build();

        let state = Arc::new(ServerState {
            cache: MetadataCache::new(config.cache_capacity),
            parser: RequestParser::new(config.max_header_size),
            resolver,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: AtomicUsize::new(0),
        });

        Ok(Self {
            listener,
            local_addr,
            state,
            pool,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let ip = self.local_addr.ip();
        let wake_ip = match ip {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => ip,
        };
        ShutdownHandle {
            flag: Arc::clone(&self.state.shutdown),
            wake_addr: SocketAddr::new(wake_ip, self.local_addr.port()),
        }
    }

    /// Accepts connections until a `ShutdownHandle` fires or a message
    /// arrives on `shutdown_rx`, then drains.
    pub fn run(self, shutdown_rx: Option<mpsc::Receiver<()>>) -> Result<(), AppError> {
        let config = &self.state.config;
        info!(
            "Server listening on {} for directory '{}' ({} workers, up to {} connections)",
            self.local_addr,
            self.state.resolver.root().display(),
            config.threads,
            config.max_connections
        );

        if let Some(rx) = shutdown_rx {
            let handle = self.shutdown_handle();
            let spawned = thread::Builder::new()
                .name("static-server-shutdown".to_string())
                .spawn(move || {
                    if rx.recv().is_ok() {
                        info!("Shutdown requested.");
                        handle.trigger();
                    }
                });
            if let Err(e) = spawned {
                warn!("Could not start shutdown listener: {e}");
            }
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.state.is_shutting_down() {
                        debug!("Not serving {peer} during shutdown");
                        break;
                    }
                    self.dispatch(stream, peer);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.state.is_shutting_down() {
                        break;
                    }
                    error!("Error accepting connection: {e}");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
        info!("Shutting down gracefully.");

        self.state.shutdown.store(true, Ordering::Relaxed);
        let Server {
            listener,
            state,
            pool,
            ..
        } = self;
        drop(listener);

        info!(
            "Stopped accepting; draining {} open connections",
            state.active_connections()
        );
        pool.join();
        info!("Server shut down gracefully.");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let log_prefix = format!("[ConnID: {}][Peer: {peer}]", generate_connection_id());
        let active = self.state.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = ConnectionSlot {
            state: Arc::clone(&self.state),
        };

        if active > self.state.config.max_connections {
            warn!(
                "{log_prefix} Maximum connections ({}) reached, rejecting",
                self.state.config.max_connections
            );
            reject(stream, &log_prefix);
            drop(slot);
            return;
        }

        debug!("{log_prefix} Accepted connection (active: {active})");
        let conn = ConnectionContext::new(stream, log_prefix, slot);
        let state = Arc::clone(&self.state);
        let pool = self.pool.clone();
        self.pool.execute(move || handle_client(conn, state, pool));
    }
}

fn reject(mut stream: TcpStream, log_prefix: &str) {
    let _ = stream.set_write_timeout(Some(REJECT_WRITE_TIMEOUT));
    let response = HttpResponse::new(StatusCode::ServiceUnavailable)
        .with_text_body("503 Service Unavailable\n".to_string())
        .keep_alive(false);
    if let Err(e) = response.send(&mut stream, false, log_prefix) {
        debug!("{log_prefix} Could not deliver 503: {e}");
    }
    let _ = stream.shutdown(Shutdown::Write);
}

/// Binds, reports the bound address on `addr_tx`, and serves until
/// `shutdown_rx` fires.
pub fn run_server(
    config: ServerConfig,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    addr_tx: Option<mpsc::Sender<SocketAddr>>,
) -> Result<(), AppError> {
    let server = Server::bind(config)?;

    if let Some(tx) = addr_tx {
        if tx.send(server.local_addr()).is_err() {
            return Err(AppError::InternalServerError(
                "Failed to send server address to caller".to_string(),
            ));
        }
    }

    server.run(shutdown_rx)
}

fn generate_connection_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn connection_ids_are_alphanumeric() {
        let id = generate_connection_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn bind_fails_when_root_is_a_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("file-root");
        std::fs::write(&root, b"not a directory").unwrap();
        let config = ServerConfig {
            directory: root,
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(config),
            Err(AppError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn bind_creates_missing_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("static");
        let config = ServerConfig {
            directory: root.clone(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        assert!(root.join("index.html").is_file());
        drop(server);
    }

    #[test]
    fn shutdown_handle_wakes_blocked_accept() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            directory: dir.path().to_path_buf(),
            listen: "0.0.0.0".to_string(),
            port: 0,
            threads: 2,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        let shutdown = server.shutdown_handle();
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            done_tx.send(server.run(None).is_ok()).ok();
        });

        // Let the loop block in accept first.
        std::thread::sleep(Duration::from_millis(200));
        shutdown.trigger();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn excess_connections_get_503() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            directory: dir.path().to_path_buf(),
            port: 0,
            threads: 2,
            max_connections: 1,
            ..ServerConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();
        let handle =
            std::thread::spawn(move || run_server(config, Some(shutdown_rx), Some(addr_tx)));
        let addr = addr_rx.recv().unwrap();

        // Holds the only slot while idle.
        let _first = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let mut second = TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut response = String::new();
        second.read_to_string(&mut response).ok();
        assert!(response.starts_with("HTTP/1.1 503"), "got {response:?}");

        drop(_first);
        shutdown_tx.send(()).unwrap();
        handle.join().unwrap().unwrap();
    }
}
