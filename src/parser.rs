//! Incremental HTTP/1.x request-head parser.
//!
//! Bytes are accumulated by the connection; `RequestParser::parse` is called
//! after every read and either returns a complete request plus the number of
//! bytes it consumed, or `None` when the header block is not finished yet.

use crate::error::AppError;
use log::trace;
use std::collections::HashMap;

/// Methods the parser recognizes. Anything else is a malformed request line.
const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    /// Recognized but not served.
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            other if KNOWN_METHODS.contains(&other) => Some(Method::Other(other.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Other(name) => name,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Method::Head)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => None,
        }
    }
}

/// Request headers keyed by lowercase name.
///
/// A repeated header replaces the earlier value, except `Range`, whose
/// range-sets are joined with `,` under the first header's unit so every
/// range-spec is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if name == "range" {
            if let Some(existing) = self.0.get_mut(&name) {
                let set = value.split_once('=').map_or(value, |(_, set)| set);
                existing.push(',');
                existing.push_str(set.trim());
                return;
            }
        }
        self.0.insert(name, value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn append_to(&mut self, name: &str, continuation: &str) {
        if let Some(existing) = self.0.get_mut(name) {
            existing.push(' ');
            existing.push_str(continuation);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    /// The raw request target, e.g. `/docs/a%20b.txt?x=1`.
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn range(&self) -> Option<&str> {
        self.header("range")
    }

    /// HTTP/1.1 keeps the connection unless told `close`; HTTP/1.0 closes
    /// unless told `keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        let tokens = self.header("connection").unwrap_or_default();
        let has = |wanted: &str| {
            tokens
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(wanted))
        };
        match self.version {
            Version::Http11 => !has("close"),
            Version::Http10 => has("keep-alive"),
        }
    }

    /// Whether a message body follows the head. Bodies are never read, so
    /// such a connection cannot be reused.
    pub fn has_body(&self) -> bool {
        if self.header("transfer-encoding").is_some() {
            return true;
        }
        self.header("content-length")
            .map(|v| v.trim() != "0")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestParser {
    max_header_size: usize,
}

impl RequestParser {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size }
    }

    /// Tries to parse one request head from the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, and
    /// `Ok(Some((request, consumed)))` once the blank line ending the head
    /// has been seen. Leading blank lines before the request line are
    /// skipped, as RFC 9112 allows.
    pub fn parse(&self, buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, AppError> {
        let leading = buf
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        let rest = &buf[leading..];

        let Some((head_len, terminator_len)) = find_head_end(rest) else {
            if buf.len() > self.max_header_size {
                return Err(AppError::RequestTooLarge);
            }
            return Ok(None);
        };

        if head_len + terminator_len > self.max_header_size {
            return Err(AppError::RequestTooLarge);
        }

        let head = String::from_utf8_lossy(&rest[..head_len]);
        let request = parse_head(&head)?;
        trace!(
            "Parsed {} {} with {} headers",
            request.method.as_str(),
            request.target,
            request.headers.len()
        );
        Ok(Some((request, leading + head_len + terminator_len)))
    }
}

/// Locates the end of the header block. Returns the head length and the
/// length of the terminator that follows it.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        match buf.get(i + 1) {
            Some(b'\n') => return Some((i, 2)),
            Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
            _ => {}
        }
    }
    None
}

fn parse_head(head: &str) -> Result<ParsedRequest, AppError> {
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let request_line = lines.next().ok_or(AppError::BadRequest)?;
    let tokens: Vec<&str> = request_line.split_whitespace().collect();
    let &[method, target, version] = tokens.as_slice() else {
        return Err(AppError::BadRequest);
    };

    let method = Method::from_token(method).ok_or(AppError::BadRequest)?;
    let version = Version::from_token(version).ok_or(AppError::BadRequest)?;
    let target = origin_form(target).ok_or(AppError::BadRequest)?;

    let mut headers = Headers::default();
    let mut last_name: Option<String> = None;
    for line in lines {
        if line.starts_with([' ', '\t']) {
            // Obsolete line folding continues the previous header.
            let name = last_name.as_deref().ok_or(AppError::BadRequest)?;
            headers.append_to(name, line.trim());
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(AppError::BadRequest)?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(AppError::BadRequest);
        }
        headers.insert(name, value.trim());
        last_name = Some(name.to_ascii_lowercase());
    }

    Ok(ParsedRequest {
        method,
        target,
        version,
        headers,
    })
}

/// Reduces an origin-form or absolute-form target to its path and query.
fn origin_form(target: &str) -> Option<String> {
    if target.starts_with('/') {
        return Some(target.to_string());
    }
    let lower = target.get(..8).map(str::to_ascii_lowercase).unwrap_or_default();
    let rest = if lower.starts_with("http://") {
        &target[7..]
    } else if lower.starts_with("https://") {
        &target[8..]
    } else {
        return None;
    };
    match rest.find('/') {
        Some(idx) => Some(rest[idx..].to_string()),
        None => Some("/".to_string()),
    }
}
