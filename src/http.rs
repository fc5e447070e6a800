//! Per-connection state machine.
//!
//! ```text
//! Accepted -> Idle -> ReadingRequest -> Resolving -> Responding -> Streaming -> Idle | Closed
//! ```
//!
//! A connection runs as a job on the worker pool. Socket reads and writes
//! use a short timeout so that no step waits on the client for long: while
//! idle, mid-request or mid-response the connection polls in ticks and hands
//! its worker back to the pool whenever other jobs are queued. The remaining
//! blocking points are file reads and the metadata cache's per-path refresh
//! slot.

use crate::cache::ResolvedFile;
use crate::error::AppError;
use crate::parser::{Method, ParsedRequest};
use crate::range::{self, RangeDecision};
use crate::response::{
    error_response, if_range_matches, is_not_modified, not_modified_response, FileBody, Progress,
    ResponseStream, SendOptions,
};
use crate::server::{ConnectionSlot, ServerState};
use log::{debug, error, trace, warn};
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use threadpool::ThreadPool;

const READ_CHUNK: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const LINGER_TIMEOUT: Duration = Duration::from_millis(50);
const CHUNKS_PER_TURN: usize = 16;

pub enum ConnectionState {
    Accepted,
    Idle,
    ReadingRequest,
    Resolving(ParsedRequest),
    Responding(ParsedRequest, Result<Arc<ResolvedFile>, AppError>),
    Streaming(Box<Transfer>),
    Closed,
}

/// A response part-way out of the door.
pub struct Transfer {
    response: ResponseStream<File>,
    status: u16,
    summary: String,
    last_progress: Instant,
}

/// What a state handler wants next: run the state right away on this
/// worker, or re-queue the connection behind waiting jobs first.
enum Step {
    Run(ConnectionState),
    Yield(ConnectionState),
}

/// State owned by the task serving one client connection.
pub struct ConnectionContext {
    stream: TcpStream,
    buffer: Vec<u8>,
    keep_alive: bool,
    requests_served: usize,
    state: ConnectionState,
    idle_since: Instant,
    request_started: Instant,
    log_prefix: String,
    _slot: ConnectionSlot,
}

impl ConnectionContext {
    pub fn new(stream: TcpStream, log_prefix: String, slot: ConnectionSlot) -> Self {
        let now = Instant::now();
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
            keep_alive: true,
            requests_served: 0,
            state: ConnectionState::Accepted,
            idle_since: now,
            request_started: now,
            log_prefix,
            _slot: slot,
        }
    }

    fn on_accepted(&mut self) -> ConnectionState {
        debug!("{} Handling client connection", self.log_prefix);
        if let Err(e) = self.stream.set_nodelay(true) {
            trace!("{} Could not set TCP_NODELAY: {e}", self.log_prefix);
        }
        if let Err(e) = self.stream.set_read_timeout(Some(POLL_INTERVAL)) {
            warn!("{} Failed to set read timeout: {e}", self.log_prefix);
            return ConnectionState::Closed;
        }
        if let Err(e) = self.stream.set_write_timeout(Some(POLL_INTERVAL)) {
            warn!("{} Failed to set write timeout: {e}", self.log_prefix);
            return ConnectionState::Closed;
        }
        self.idle_since = Instant::now();
        ConnectionState::Idle
    }

    /// Waits for the first byte of the next request.
    ///
    /// A fresh connection gets the request timeout to send something; a
    /// kept-alive one gets the keep-alive timeout. Expiry closes silently.
    fn wait_for_request(&mut self, server: &ServerState, pool: &ThreadPool) -> Step {
        if !self.buffer.is_empty() {
            self.request_started = Instant::now();
            return Step::Run(ConnectionState::ReadingRequest);
        }

        let limit = if self.requests_served == 0 {
            server.config.request_timeout()
        } else {
            Some(server.config.keep_alive_timeout())
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if server.is_shutting_down() {
                debug!("{} Closing idle connection for shutdown", self.log_prefix);
                return Step::Run(ConnectionState::Closed);
            }
            if limit.is_some_and(|limit| self.idle_since.elapsed() >= limit) {
                debug!("{} {}", self.log_prefix, AppError::Timeout);
                return Step::Run(ConnectionState::Closed);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("{} Connection closed by client", self.log_prefix);
                    return Step::Run(ConnectionState::Closed);
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.request_started = Instant::now();
                    return Step::Run(ConnectionState::ReadingRequest);
                }
                Err(e) if is_timeout(&e) => {
                    if pool.queued_count() > 0 {
                        return Step::Yield(ConnectionState::Idle);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("{} Read error while idle: {e}", self.log_prefix);
                    return Step::Run(ConnectionState::Closed);
                }
            }
        }
    }

    /// Feeds bytes to the parser until a full request head is buffered.
    ///
    /// The head must be complete within the request timeout, counted from
    /// its first byte. Partial input stays in the buffer across yields.
    fn read_request(&mut self, server: &ServerState, pool: &ThreadPool) -> Step {
        let deadline = server
            .config
            .request_timeout()
            .map(|limit| self.request_started + limit);

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match server.parser.parse(&self.buffer) {
                Ok(Some((request, consumed))) => {
                    self.buffer.drain(..consumed);
                    self.requests_served += 1;
                    return Step::Run(ConnectionState::Resolving(request));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{} Rejecting request: {e}", self.log_prefix);
                    self.keep_alive = false;
                    return Step::Run(self.error_transfer(&e, false, "-"));
                }
            }

            loop {
                if server.is_shutting_down() {
                    debug!("{} Dropping partial request for shutdown", self.log_prefix);
                    return Step::Run(ConnectionState::Closed);
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    debug!("{} {} while reading request", self.log_prefix, AppError::Timeout);
                    return Step::Run(ConnectionState::Closed);
                }

                match self.stream.read(&mut chunk) {
                    Ok(0) => {
                        debug!("{} Client closed mid-request", self.log_prefix);
                        return Step::Run(ConnectionState::Closed);
                    }
                    Ok(n) => {
                        self.buffer.extend_from_slice(&chunk[..n]);
                        break;
                    }
                    Err(e) if is_timeout(&e) => {
                        if pool.queued_count() > 0 {
                            return Step::Yield(ConnectionState::ReadingRequest);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("{} Read error: {e}", self.log_prefix);
                        return Step::Run(ConnectionState::Closed);
                    }
                }
            }
        }
    }

    fn resolve(&self, server: &ServerState, request: ParsedRequest) -> ConnectionState {
        let outcome = match request.method {
            Method::Get | Method::Head => {
                server
                    .resolver
                    .resolve(&request.target, &server.cache, &self.log_prefix)
            }
            Method::Other(_) => Err(AppError::MethodNotAllowed),
        };
        ConnectionState::Responding(request, outcome)
    }

    /// Decides keep-alive and turns the resolved outcome into a transfer.
    fn respond(
        &mut self,
        server: &ServerState,
        request: ParsedRequest,
        outcome: Result<Arc<ResolvedFile>, AppError>,
    ) -> ConnectionState {
        self.keep_alive = request.wants_keep_alive()
            && !request.has_body()
            && !server.is_shutting_down()
            && server.config.keep_alive_timeout > 0
            && self.requests_served < server.config.max_keep_alive_requests;

        let summary = format!("{} {}", request.method.as_str(), request.target);
        let prepared = match outcome {
            Ok(file) => self.prepare_file(server, &request, &file, &summary),
            Err(e) => Err(e),
        };

        match prepared {
            Ok(next) => next,
            Err(e) => {
                self.log_error(&summary, &e);
                self.error_transfer(&e, request.method.is_head(), &summary)
            }
        }
    }

    fn prepare_file(
        &self,
        server: &ServerState,
        request: &ParsedRequest,
        file: &Arc<ResolvedFile>,
        summary: &str,
    ) -> Result<ConnectionState, AppError> {
        if is_not_modified(request, file) {
            let response = not_modified_response(file).keep_alive(self.keep_alive);
            return Ok(begin(ResponseStream::from_response(response, true), 304, summary));
        }

        let handle = File::open(&file.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::NotFound,
            ErrorKind::PermissionDenied => AppError::Forbidden,
            _ => AppError::Io(e),
        })?;

        // The open handle is authoritative if the file changed since it was cached.
        let current = handle.metadata()?;
        let file = if file.matches(&current) {
            Arc::clone(file)
        } else {
            debug!("{} File changed after lookup, using fresh metadata", self.log_prefix);
            Arc::new(ResolvedFile::from_metadata(file.path.clone(), &current)?)
        };

        let decision = if if_range_matches(request, &file) {
            range::compute(request.range(), file.len)
        } else {
            RangeDecision::Full
        };
        let (body, status) = match decision {
            RangeDecision::Full => (FileBody::Full, 200),
            RangeDecision::Partial(mut ranges) if ranges.len() == 1 => {
                (FileBody::Single(ranges.remove(0)), 206)
            }
            RangeDecision::Partial(ranges) => (FileBody::Multipart(ranges), 206),
            RangeDecision::Unsatisfiable => return Err(AppError::Unsatisfiable(file.len)),
        };

        let options = SendOptions {
            head_only: request.method.is_head(),
            keep_alive: self.keep_alive,
            chunk_size: server.config.chunk_size,
        };
        Ok(begin(ResponseStream::file(handle, &file, &body, options), status, summary))
    }

    /// The error's response as a transfer, or `Closed` when the error has
    /// none. The connection stays open only for errors that leave the
    /// request stream in sync.
    fn error_transfer(&mut self, err: &AppError, head_only: bool, summary: &str) -> ConnectionState {
        if !err.keeps_connection() {
            self.keep_alive = false;
        }
        let Some(response) = error_response(err) else {
            self.keep_alive = false;
            return ConnectionState::Closed;
        };
        let status = response.status.code();
        let response = response.keep_alive(self.keep_alive);
        begin(ResponseStream::from_response(response, head_only), status, summary)
    }

    /// Writes up to `CHUNKS_PER_TURN` chunks per pass.
    ///
    /// A peer that accepts nothing for the write timeout is dropped; one
    /// that is merely slow keeps its transfer but gives up the worker
    /// whenever other jobs are waiting.
    fn stream(&mut self, server: &ServerState, pool: &ThreadPool, mut transfer: Box<Transfer>) -> Step {
        loop {
            let before = transfer.response.written();
            match transfer.response.pump(&mut &self.stream, CHUNKS_PER_TURN) {
                Ok(Progress::Done) => {
                    self.access_log(
                        &transfer.summary,
                        transfer.status,
                        transfer.response.body_written(),
                    );
                    return Step::Run(self.after_response());
                }
                Ok(progress) => {
                    let now = Instant::now();
                    if transfer.response.written() > before {
                        transfer.last_progress = now;
                    } else if progress == Progress::Blocked
                        && server
                            .config
                            .write_timeout()
                            .is_some_and(|limit| now.duration_since(transfer.last_progress) >= limit)
                    {
                        debug!(
                            "{} Client stopped reading, dropping {}",
                            self.log_prefix, transfer.summary
                        );
                        return Step::Run(ConnectionState::Closed);
                    }
                    if pool.queued_count() > 0 {
                        return Step::Yield(ConnectionState::Streaming(transfer));
                    }
                }
                Err(AppError::Io(e)) if is_disconnect(&e) => {
                    debug!("{} Client went away mid-response: {e}", self.log_prefix);
                    return Step::Run(ConnectionState::Closed);
                }
                Err(e) => {
                    warn!("{} Aborting connection: {e}", self.log_prefix);
                    return Step::Run(ConnectionState::Closed);
                }
            }
        }
    }

    fn after_response(&mut self) -> ConnectionState {
        if self.keep_alive {
            self.idle_since = Instant::now();
            ConnectionState::Idle
        } else {
            ConnectionState::Closed
        }
    }

    fn log_error(&self, summary: &str, err: &AppError) {
        let code = err.status().map(|s| s.code()).unwrap_or_default();
        if code >= 500 {
            error!("{} {summary} -> {code}: {err}", self.log_prefix);
        } else {
            debug!("{} {summary} -> {code}: {err}", self.log_prefix);
        }
    }

    fn access_log(&self, summary: &str, status: u16, written: u64) {
        debug!(
            "{} {summary} -> {status} ({})",
            self.log_prefix,
            humansize::format_size(written, humansize::BINARY)
        );
    }

    /// Half-closes and briefly drains so unread request bytes do not turn
    /// the close into a reset that destroys the response in flight.
    fn close(&mut self) {
        if self.stream.shutdown(Shutdown::Write).is_err() {
            return;
        }
        if self.stream.set_read_timeout(Some(LINGER_TIMEOUT)).is_err() {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..4 {
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

fn begin(response: ResponseStream<File>, status: u16, summary: &str) -> ConnectionState {
    ConnectionState::Streaming(Box::new(Transfer {
        response,
        status,
        summary: summary.to_string(),
        last_progress: Instant::now(),
    }))
}

/// Runs a connection until it closes or yields its worker.
///
/// Yielding re-queues the connection behind the jobs already waiting, so a
/// few slow or idle clients cannot monopolize the pool.
pub fn handle_client(mut conn: ConnectionContext, server: Arc<ServerState>, pool: ThreadPool) {
    loop {
        let state = std::mem::replace(&mut conn.state, ConnectionState::Closed);
        let step = match state {
            ConnectionState::Accepted => Step::Run(conn.on_accepted()),
            ConnectionState::Idle => conn.wait_for_request(&server, &pool),
            ConnectionState::ReadingRequest => conn.read_request(&server, &pool),
            ConnectionState::Resolving(request) => Step::Run(conn.resolve(&server, request)),
            ConnectionState::Responding(request, outcome) => {
                Step::Run(conn.respond(&server, request, outcome))
            }
            ConnectionState::Streaming(transfer) => conn.stream(&server, &pool, transfer),
            ConnectionState::Closed => {
                conn.close();
                debug!(
                    "{} Closed after {} request(s)",
                    conn.log_prefix, conn.requests_served
                );
                return;
            }
        };

        match step {
            Step::Run(next) => conn.state = next,
            Step::Yield(next) => {
                trace!("{} Yielding worker", conn.log_prefix);
                conn.state = next;
                let next_pool = pool.clone();
                pool.execute(move || handle_client(conn, server, next_pool));
                return;
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
