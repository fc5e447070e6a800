use crate::cache::ResolvedFile;
use crate::error::AppError;
use crate::parser::ParsedRequest;
use crate::range::ByteRange;
use chrono::{DateTime, Utc};
use log::{debug, error, trace};
use rand::Rng;
use std::collections::VecDeque;
use std::io::{self, prelude::*, SeekFrom};
use std::path::Path;
use std::time::SystemTime;

const SERVER_NAME: &str = concat!("static-server/", env!("CARGO_PKG_VERSION"));
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const BOUNDARY_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    PartialContent,
    NotModified,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    RangeNotSatisfiable,
    RequestHeaderFieldsTooLarge,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::RangeNotSatisfiable => "Range Not Satisfiable",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Native MIME type detection for common file types
pub fn get_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        Some("zip") => "application/zip",
        Some("tar") => "application/x-tar",
        Some("gz") => "application/gzip",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Formats a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE_FORMAT).to_string()
}

/// A response whose body is small enough to hold in memory: errors, 304s and 416s.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![
                ("Server".to_string(), SERVER_NAME.to_string()),
                ("Date".to_string(), http_date(SystemTime::now())),
            ],
            body: Vec::new(),
        }
    }

    pub fn with_text_body(mut self, body: String) -> Self {
        self.headers.push((
            "Content-Type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        ));
        self.body = body.into_bytes();
        self
    }

    pub fn add_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }

    pub fn keep_alive(self, keep_alive: bool) -> Self {
        let value = if keep_alive { "keep-alive" } else { "close" };
        self.add_header("Connection", value.to_string())
    }

    /// Status line and headers. A 304 carries no `Content-Length`; every
    /// other status declares the body length, even for HEAD.
    pub fn encode_head(&self) -> String {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason());
        if self.status != StatusCode::NotModified {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    /// Writes the response in one go. Used where a single small write cannot
    /// stall a worker for long, such as the 503 sent to rejected connections.
    pub fn send<W: Write>(self, out: &mut W, head_only: bool, log_prefix: &str) -> Result<(), AppError> {
        debug!(
            "{} Sending response - Status: {}, Body Length: {}",
            log_prefix,
            self.status.code(),
            self.body.len()
        );

        let head = self.encode_head();
        out.write_all(head.as_bytes()).map_err(|e| {
            debug!("{log_prefix} Failed to write response headers: {e}");
            AppError::Io(e)
        })?;

        if !head_only && !self.body.is_empty() {
            out.write_all(&self.body).map_err(|e| {
                debug!("{log_prefix} Failed to write response body: {e}");
                AppError::Io(e)
            })?;
        }

        out.flush().map_err(|e| {
            debug!("{log_prefix} Failed to flush response: {e}");
            AppError::Io(e)
        })?;

        Ok(())
    }
}

/// Builds the minimal response for a client-facing error, or `None` when
/// the error closes the connection silently. Bodies never include paths or
/// internal error text.
pub fn error_response(err: &AppError) -> Option<HttpResponse> {
    let status = err.status()?;
    let mut response = HttpResponse::new(status);
    match err {
        AppError::Unsatisfiable(len) => {
            response = response
                .add_header("Content-Range", format!("bytes */{len}"))
                .add_header("Accept-Ranges", "bytes".to_string());
        }
        AppError::MethodNotAllowed => {
            response = response
                .add_header("Allow", "GET, HEAD".to_string())
                .with_text_body(format!("{} {}\n", status.code(), status.reason()));
        }
        _ => {
            response = response.with_text_body(format!("{} {}\n", status.code(), status.reason()));
        }
    }
    Some(response)
}

/// 304 response carrying the current validators.
pub fn not_modified_response(file: &ResolvedFile) -> HttpResponse {
    HttpResponse::new(StatusCode::NotModified)
        .add_header("ETag", file.etag.clone())
        .add_header("Last-Modified", http_date(file.modified))
}

/// True when the client's cached copy is current, per `If-None-Match`
/// or, when that header is absent, `If-Modified-Since`.
pub fn is_not_modified(request: &ParsedRequest, file: &ResolvedFile) -> bool {
    if let Some(if_none_match) = request.header("if-none-match") {
        return if_none_match.split(',').any(|tag| {
            let tag = tag.trim();
            tag == "*" || weak_eq(tag, &file.etag)
        });
    }
    if let Some(since) = request.header("if-modified-since") {
        if let Ok(since) = DateTime::parse_from_rfc2822(since) {
            let modified = DateTime::<Utc>::from(file.modified).timestamp();
            return modified <= since.timestamp();
        }
    }
    false
}

/// `If-Range`: the range applies only if the validator still matches the file.
/// A missing header always lets the range through.
pub fn if_range_matches(request: &ParsedRequest, file: &ResolvedFile) -> bool {
    let Some(validator) = request.header("if-range") else {
        return true;
    };
    let validator = validator.trim();
    if validator.starts_with('"') {
        return validator == file.etag;
    }
    match DateTime::parse_from_rfc2822(validator) {
        Ok(date) => DateTime::<Utc>::from(file.modified).timestamp() == date.timestamp(),
        Err(_) => false,
    }
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

/// What body a file response carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileBody {
    Full,
    Single(ByteRange),
    Multipart(Vec<ByteRange>),
}

/// Per-response switches for `ResponseStream::file`.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub head_only: bool,
    pub keep_alive: bool,
    pub chunk_size: usize,
}

/// Outcome of one `ResponseStream::pump` turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// The chunk budget ran out with bytes still to send.
    Pending,
    /// The writer took nothing before its timeout.
    Blocked,
}

enum Segment {
    Bytes(Vec<u8>),
    File { offset: u64, remaining: u64 },
}

/// A response written out a chunk at a time.
///
/// The head and multipart delimiters are queued as byte segments; file
/// content is queued as `(offset, length)` and read from `source` only when
/// the previous chunk has been fully written. At most one chunk is buffered,
/// so memory per connection does not grow with file size, and `pump` can
/// stop after any chunk and resume later on another worker.
pub struct ResponseStream<R> {
    source: Option<R>,
    position: Option<u64>,
    segments: VecDeque<Segment>,
    pending: Vec<u8>,
    pending_pos: usize,
    chunk_size: usize,
    head_len: u64,
    declared_len: u64,
    written: u64,
}

impl<R: Read + Seek> ResponseStream<R> {
    /// Streams a file response: headers, then the selected body.
    ///
    /// `Content-Length` is computed up front. A source that ends early is an
    /// error rather than a short body, since a short body would
    /// desynchronize the next request on a kept-alive connection.
    pub fn file(source: R, file: &ResolvedFile, body: &FileBody, options: SendOptions) -> Self {
        let status = match body {
            FileBody::Full => StatusCode::Ok,
            _ => StatusCode::PartialContent,
        };

        let mut head = format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason());
        head.push_str(&format!("Server: {SERVER_NAME}\r\n"));
        head.push_str(&format!("Date: {}\r\n", http_date(SystemTime::now())));
        head.push_str(&format!("Last-Modified: {}\r\n", http_date(file.modified)));
        head.push_str(&format!("ETag: {}\r\n", file.etag));
        head.push_str("Accept-Ranges: bytes\r\n");

        let mut body_segments = VecDeque::new();
        let content_length = match body {
            FileBody::Full => {
                head.push_str(&format!("Content-Type: {}\r\n", file.content_type));
                push_file_segment(&mut body_segments, 0, file.len);
                file.len
            }
            FileBody::Single(range) => {
                head.push_str(&format!("Content-Type: {}\r\n", file.content_type));
                head.push_str(&format!("Content-Range: {}\r\n", range.content_range(file.len)));
                push_file_segment(&mut body_segments, range.start, range.len());
                range.len()
            }
            FileBody::Multipart(ranges) => {
                let boundary = generate_boundary();
                head.push_str(&format!(
                    "Content-Type: multipart/byteranges; boundary={boundary}\r\n"
                ));
                for range in ranges {
                    body_segments.push_back(Segment::Bytes(
                        part_header(range, file, &boundary).into_bytes(),
                    ));
                    push_file_segment(&mut body_segments, range.start, range.len());
                }
                body_segments.push_back(Segment::Bytes(closing_delimiter(&boundary).into_bytes()));
                multipart_length(ranges, file, &boundary)
            }
        };
        head.push_str(&format!("Content-Length: {content_length}\r\n"));
        head.push_str(if options.keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");

        let head_len = head.len() as u64;
        let mut segments = VecDeque::from([Segment::Bytes(head.into_bytes())]);
        let declared_len = if options.head_only {
            head_len
        } else {
            segments.append(&mut body_segments);
            head_len + content_length
        };

        Self {
            source: Some(source),
            position: None,
            segments,
            pending: Vec::with_capacity(options.chunk_size.max(1)),
            pending_pos: 0,
            chunk_size: options.chunk_size.max(1),
            head_len,
            declared_len,
            written: 0,
        }
    }

    /// A small response already held in memory.
    pub fn from_response(response: HttpResponse, head_only: bool) -> Self {
        let head = response.encode_head().into_bytes();
        let head_len = head.len() as u64;
        let mut declared_len = head_len;
        let mut segments = VecDeque::from([Segment::Bytes(head)]);
        if !head_only && !response.body.is_empty() {
            declared_len += response.body.len() as u64;
            segments.push_back(Segment::Bytes(response.body));
        }

        Self {
            source: None,
            position: None,
            segments,
            pending: Vec::new(),
            pending_pos: 0,
            chunk_size: declared_len.max(1) as usize,
            head_len,
            declared_len,
            written: 0,
        }
    }

    /// Total bytes handed to the writer so far, head included.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Body bytes handed to the writer so far.
    pub fn body_written(&self) -> u64 {
        self.written.saturating_sub(self.head_len)
    }

    /// Writes at most `max_chunks` chunks to `out`.
    ///
    /// A writer with a short timeout makes this non-blocking in effect: a
    /// stalled peer surfaces as `Blocked` instead of pinning the caller.
    pub fn pump<W: Write>(&mut self, out: &mut W, max_chunks: usize) -> Result<Progress, AppError> {
        for _ in 0..max_chunks.max(1) {
            if self.pending_pos == self.pending.len() {
                self.fill()?;
                if self.pending.is_empty() {
                    return self.finish();
                }
            }

            match out.write(&self.pending[self.pending_pos..]) {
                Ok(0) => return Err(AppError::Io(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => {
                    self.pending_pos += n;
                    self.written += n as u64;
                    trace!("Wrote {n} bytes, {} of {} sent", self.written, self.declared_len);
                    if self.pending_pos == self.pending.len() && self.segments.is_empty() {
                        return self.finish();
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(Progress::Blocked)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(AppError::Io(e)),
            }
        }
        Ok(Progress::Pending)
    }

    /// Refills the chunk buffer from the queued segments.
    fn fill(&mut self) -> Result<(), AppError> {
        self.pending.clear();
        self.pending_pos = 0;

        while self.pending.len() < self.chunk_size {
            let Some(segment) = self.segments.front_mut() else {
                break;
            };
            let exhausted = match segment {
                Segment::Bytes(bytes) => {
                    self.pending.append(bytes);
                    true
                }
                Segment::File { offset, remaining } => {
                    let source = self.source.as_mut().ok_or_else(|| {
                        AppError::InternalServerError("file segment without a source".into())
                    })?;
                    if self.position != Some(*offset) {
                        source.seek(SeekFrom::Start(*offset))?;
                    }

                    let room = (self.chunk_size - self.pending.len()) as u64;
                    let start = self.pending.len();
                    self.pending.resize(start + (*remaining).min(room) as usize, 0);
                    let read = loop {
                        match source.read(&mut self.pending[start..]) {
                            Ok(n) => break n,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(AppError::Io(e)),
                        }
                    };
                    if read == 0 {
                        return Err(AppError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file truncated while streaming",
                        )));
                    }
                    self.pending.truncate(start + read);

                    *offset += read as u64;
                    *remaining -= read as u64;
                    self.position = Some(*offset);
                    *remaining == 0
                }
            };
            if exhausted {
                self.segments.pop_front();
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<Progress, AppError> {
        if self.written != self.declared_len {
            error!(
                "Response length mismatch: declared {}, wrote {}",
                self.declared_len, self.written
            );
            return Err(AppError::InternalServerError("body length mismatch".into()));
        }
        Ok(Progress::Done)
    }
}

fn push_file_segment(segments: &mut VecDeque<Segment>, offset: u64, len: u64) {
    if len > 0 {
        segments.push_back(Segment::File {
            offset,
            remaining: len,
        });
    }
}

fn part_header(range: &ByteRange, file: &ResolvedFile, boundary: &str) -> String {
    format!(
        "\r\n--{boundary}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
        file.content_type,
        range.content_range(file.len)
    )
}

fn closing_delimiter(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

fn multipart_length(ranges: &[ByteRange], file: &ResolvedFile, boundary: &str) -> u64 {
    let parts: u64 = ranges
        .iter()
        .map(|range| part_header(range, file, boundary).len() as u64 + range.len())
        .sum();
    parts + closing_delimiter(boundary).len() as u64
}

fn generate_boundary() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(BOUNDARY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileKind;
    use crate::parser::RequestParser;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::Duration;

    fn resolved(len: u64) -> ResolvedFile {
        ResolvedFile {
            path: PathBuf::from("/srv/test.txt"),
            kind: FileKind::File,
            len,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777),
            content_type: "text/plain; charset=utf-8",
            etag: "\"abc\"".to_string(),
        }
    }

    fn request(raw: &str) -> ParsedRequest {
        RequestParser::new(8192)
            .parse(raw.as_bytes())
            .unwrap()
            .unwrap()
            .0
    }

    fn options(head_only: bool) -> SendOptions {
        SendOptions {
            head_only,
            keep_alive: true,
            chunk_size: 7,
        }
    }

    fn drain<R: Read + Seek>(stream: &mut ResponseStream<R>) -> Result<Vec<u8>, AppError> {
        let mut out = Vec::new();
        while stream.pump(&mut out, 4)? != Progress::Done {}
        Ok(out)
    }

    fn stream_file(data: Vec<u8>, len: u64, body: FileBody, head_only: bool) -> Vec<u8> {
        let mut stream =
            ResponseStream::file(Cursor::new(data), &resolved(len), &body, options(head_only));
        drain(&mut stream).unwrap()
    }

    fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
        let pos = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(raw[..pos].to_vec()).unwrap(),
            raw[pos + 4..].to_vec(),
        )
    }

    /// Accepts bytes until `capacity` is reached, then reports `WouldBlock`.
    struct StallingWriter {
        accepted: Vec<u8>,
        capacity: usize,
    }

    impl Write for StallingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity.saturating_sub(self.accepted.len());
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn http_date_is_imf_fixdate() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(get_mime_type(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(get_mime_type(Path::new("a.png")), "image/png");
        assert_eq!(get_mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn full_body_matches_source() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut stream = ResponseStream::file(
            Cursor::new(data.clone()),
            &resolved(100),
            &FileBody::Full,
            options(false),
        );
        let out = drain(&mut stream).unwrap();
        assert_eq!(stream.body_written(), 100);

        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains("Content-Length: 100"));
        assert!(head.contains("ETag: \"abc\""));
        assert!(head.contains("Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT"));
        assert_eq!(body, data);
    }

    #[test]
    fn single_range_body() {
        let data: Vec<u8> = (0..100u8).collect();
        let out = stream_file(
            data.clone(),
            100,
            FileBody::Single(ByteRange { start: 10, end: 19 }),
            false,
        );
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(head.contains("Content-Range: bytes 10-19/100"));
        assert!(head.contains("Content-Length: 10"));
        assert_eq!(body, &data[10..20]);
    }

    #[test]
    fn head_only_writes_no_body() {
        let out = stream_file(vec![1u8; 50], 50, FileBody::Full, true);
        let (head, body) = split_response(&out);
        assert!(head.contains("Content-Length: 50"));
        assert!(body.is_empty());
    }

    #[test]
    fn empty_file_has_zero_length() {
        let out = stream_file(Vec::new(), 0, FileBody::Full, false);
        let (head, body) = split_response(&out);
        assert!(head.contains("Content-Length: 0"));
        assert!(body.is_empty());
    }

    #[test]
    fn multipart_length_is_exact() {
        let data: Vec<u8> = (0..100u8).collect();
        let out = stream_file(
            data,
            100,
            FileBody::Multipart(vec![
                ByteRange { start: 0, end: 4 },
                ByteRange { start: 90, end: 99 },
            ]),
            false,
        );
        let (head, body) = split_response(&out);
        let declared: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Content-Range: bytes 0-4/100"));
        assert!(text.contains("Content-Range: bytes 90-99/100"));
        assert!(head.contains("multipart/byteranges; boundary="));
    }

    #[test]
    fn truncated_source_is_an_error() {
        let mut stream = ResponseStream::file(
            Cursor::new(vec![0u8; 10]),
            &resolved(100),
            &FileBody::Full,
            options(false),
        );
        assert!(matches!(drain(&mut stream), Err(AppError::Io(_))));
    }

    #[test]
    fn pump_respects_chunk_budget() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut stream = ResponseStream::file(
            Cursor::new(data.clone()),
            &resolved(100),
            &FileBody::Full,
            options(false),
        );

        let mut out = Vec::new();
        assert_eq!(stream.pump(&mut out, 2).unwrap(), Progress::Pending);
        assert!(stream.body_written() < 100);

        let mut turns = 1;
        while stream.pump(&mut out, 2).unwrap() != Progress::Done {
            turns += 1;
        }
        assert!(turns > 5);
        assert_eq!(split_response(&out).1, data);
    }

    #[test]
    fn stalled_writer_blocks_then_resumes() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut stream = ResponseStream::file(
            Cursor::new(data.clone()),
            &resolved(100),
            &FileBody::Full,
            options(false),
        );

        let mut out = StallingWriter {
            accepted: Vec::new(),
            capacity: 50,
        };
        assert_eq!(stream.pump(&mut out, 1000).unwrap(), Progress::Blocked);
        assert_eq!(stream.written(), 50);
        assert_eq!(stream.pump(&mut out, 1000).unwrap(), Progress::Blocked);

        out.capacity = usize::MAX;
        assert_eq!(stream.pump(&mut out, 1000).unwrap(), Progress::Done);
        assert_eq!(split_response(&out.accepted).1, data);
    }

    #[test]
    fn error_responses_are_framed_and_generic() {
        let mut out = Vec::new();
        error_response(&AppError::NotFound)
            .unwrap()
            .keep_alive(true)
            .send(&mut out, false, "TEST")
            .unwrap();
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 404 Not Found"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert_eq!(body, b"404 Not Found\n");

        assert!(error_response(&AppError::Timeout).is_none());
        let io = error_response(&AppError::Io(io::Error::other("/secret/path"))).unwrap();
        assert!(!String::from_utf8_lossy(&io.body).contains("secret"));
    }

    #[test]
    fn in_memory_responses_stream_like_files() {
        let response = error_response(&AppError::NotFound).unwrap().keep_alive(false);
        let mut stream: ResponseStream<Cursor<Vec<u8>>> = ResponseStream::from_response(response, false);
        let out = drain(&mut stream).unwrap();
        let (head, body) = split_response(&out);
        assert!(head.contains("Connection: close"));
        assert_eq!(body, b"404 Not Found\n");
        assert_eq!(stream.body_written(), body.len() as u64);

        let response = error_response(&AppError::NotFound).unwrap();
        let mut stream: ResponseStream<Cursor<Vec<u8>>> = ResponseStream::from_response(response, true);
        let out = drain(&mut stream).unwrap();
        assert!(split_response(&out).1.is_empty());
    }

    #[test]
    fn unsatisfiable_has_content_range_and_no_body() {
        let mut out = Vec::new();
        error_response(&AppError::Unsatisfiable(1024))
            .unwrap()
            .send(&mut out, false, "TEST")
            .unwrap();
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 416"));
        assert!(head.contains("Content-Range: bytes */1024"));
        assert!(head.contains("Content-Length: 0"));
        assert!(body.is_empty());
    }

    #[test]
    fn conditional_requests() {
        let file = resolved(10);
        assert!(is_not_modified(
            &request("GET / HTTP/1.1\r\nIf-None-Match: \"x\", \"abc\"\r\n\r\n"),
            &file
        ));
        assert!(!is_not_modified(
            &request("GET / HTTP/1.1\r\nIf-None-Match: \"x\"\r\n\r\n"),
            &file
        ));
        assert!(is_not_modified(
            &request("GET / HTTP/1.1\r\nIf-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n"),
            &file
        ));
        assert!(!is_not_modified(
            &request("GET / HTTP/1.1\r\nIf-Modified-Since: Sat, 05 Nov 1994 08:49:37 GMT\r\n\r\n"),
            &file
        ));
        // If-None-Match takes precedence over If-Modified-Since.
        assert!(!is_not_modified(
            &request(
                "GET / HTTP/1.1\r\nIf-None-Match: \"x\"\r\nIf-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n"
            ),
            &file
        ));
    }

    #[test]
    fn if_range_validators() {
        let file = resolved(10);
        assert!(if_range_matches(&request("GET / HTTP/1.1\r\n\r\n"), &file));
        assert!(if_range_matches(
            &request("GET / HTTP/1.1\r\nIf-Range: \"abc\"\r\n\r\n"),
            &file
        ));
        assert!(!if_range_matches(
            &request("GET / HTTP/1.1\r\nIf-Range: \"old\"\r\n\r\n"),
            &file
        ));
        assert!(if_range_matches(
            &request("GET / HTTP/1.1\r\nIf-Range: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n"),
            &file
        ));
    }
}
