use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_NONE_MATCH, RANGE};
use static_server::config::ServerConfig;
use static_server::server::run_server;
use std::fs::{self, File};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tempfile::{tempdir, TempDir};

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
    temp_dir: TempDir,
    contents: Vec<u8>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn setup_test_server() -> TestServer {
    let dir = tempdir().unwrap();

    let mut contents = vec![0u8; 1024];
    rand::rng().fill_bytes(&mut contents);
    File::create(dir.path().join("test.txt"))
        .unwrap()
        .write_all(&contents)
        .unwrap();
    File::create(dir.path().join("index.html"))
        .unwrap()
        .write_all(b"<h1>It works</h1>")
        .unwrap();

    let config = ServerConfig {
        directory: dir.path().to_path_buf(),
        listen: "127.0.0.1".to_string(),
        port: 0, // Use port 0 to let the OS pick a free port
        threads: 4,
        keep_alive_timeout: 2,
        ..ServerConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let (addr_tx, addr_rx) = mpsc::channel();

    let server_handle = thread::spawn(move || {
        if let Err(e) = run_server(config, Some(shutdown_rx), Some(addr_tx)) {
            eprintln!("Server thread failed: {e}");
        }
    });

    let server_addr = addr_rx.recv().unwrap();

    TestServer {
        addr: server_addr,
        shutdown_tx,
        handle: Some(server_handle),
        temp_dir: dir,
        contents,
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown_tx.send(()).ok(); // Use ok() to avoid panic on shutdown
            handle.join().unwrap();
        }
    }
}

#[test]
fn test_full_get() {
    let server = setup_test_server();
    let client = Client::new();

    let res = client.get(server.url("/test.txt")).send().unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-length"], "1024");
    assert_eq!(res.headers()["accept-ranges"], "bytes");
    assert!(res.headers().contains_key("last-modified"));
    assert!(res.headers().contains_key(ETAG));
    assert_eq!(res.bytes().unwrap().as_ref(), server.contents.as_slice());
}

#[test]
fn test_single_range() {
    let server = setup_test_server();
    let client = Client::new();

    let res = client
        .get(server.url("/test.txt"))
        .header(RANGE, "bytes=0-511")
        .send()
        .unwrap();
    assert_eq!(res.status(), 206);
    assert_eq!(res.headers()["content-range"], "bytes 0-511/1024");
    assert_eq!(res.headers()["content-length"], "512");
    assert_eq!(res.bytes().unwrap().as_ref(), &server.contents[..512]);
}

#[test]
fn test_whole_file_range_matches_plain_get() {
    let server = setup_test_server();
    let client = Client::new();

    let plain = client.get(server.url("/test.txt")).send().unwrap();
    let plain_etag = plain.headers()[ETAG].clone();
    let plain_body = plain.bytes().unwrap();

    let ranged = client
        .get(server.url("/test.txt"))
        .header(RANGE, "bytes=0-1023")
        .send()
        .unwrap();
    assert_eq!(ranged.status(), 206);
    assert_eq!(ranged.headers()["content-range"], "bytes 0-1023/1024");
    assert_eq!(ranged.headers()[ETAG], plain_etag);
    assert_eq!(ranged.bytes().unwrap(), plain_body);
}

#[test]
fn test_unsatisfiable_range() {
    let server = setup_test_server();
    let client = Client::new();

    let res = client
        .get(server.url("/test.txt"))
        .header(RANGE, "bytes=2000-3000")
        .send()
        .unwrap();
    assert_eq!(res.status(), 416);
    assert_eq!(res.headers()["content-range"], "bytes */1024");
    assert!(res.bytes().unwrap().is_empty());
}

#[test]
fn test_head_matches_get_headers() {
    let server = setup_test_server();
    let client = Client::new();

    let get = client.get(server.url("/test.txt")).send().unwrap();
    let head = client.head(server.url("/test.txt")).send().unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(head.headers()["content-length"], get.headers()["content-length"]);
    assert_eq!(head.headers()[ETAG], get.headers()[ETAG]);
    assert!(head.bytes().unwrap().is_empty());
}

#[test]
fn test_etag_is_stable_and_conditional_get() {
    let server = setup_test_server();
    let client = Client::new();

    let first = client.get(server.url("/test.txt")).send().unwrap();
    let second = client.get(server.url("/test.txt")).send().unwrap();
    assert_eq!(first.headers()[ETAG], second.headers()[ETAG]);
    assert_eq!(
        first.headers()["content-length"],
        second.headers()["content-length"]
    );

    let etag = first.headers()[ETAG].clone();
    let res = client
        .get(server.url("/test.txt"))
        .header(IF_NONE_MATCH, etag.clone())
        .send()
        .unwrap();
    assert_eq!(res.status(), 304);
    assert_eq!(res.headers()[ETAG], etag);
    assert!(res.bytes().unwrap().is_empty());

    let last_modified = second.headers()["last-modified"].clone();
    let res = client
        .get(server.url("/test.txt"))
        .header("If-Modified-Since", last_modified)
        .send()
        .unwrap();
    assert_eq!(res.status(), 304);
}

#[test]
fn test_modified_file_is_picked_up() {
    let server = setup_test_server();
    let client = Client::new();

    let before = client.get(server.url("/test.txt")).send().unwrap();
    let before_etag = before.headers()[ETAG].clone();
    assert_eq!(before.headers()["content-length"], "1024");

    let path = server.temp_dir.path().join("test.txt");
    fs::write(&path, vec![b'z'; 2048]).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();

    let after = client.get(server.url("/test.txt")).send().unwrap();
    assert_eq!(after.status(), 200);
    assert_eq!(after.headers()["content-length"], "2048");
    assert_ne!(after.headers()[ETAG], before_etag);
    assert_eq!(after.bytes().unwrap().as_ref(), vec![b'z'; 2048].as_slice());
}

#[test]
fn test_index_and_errors() {
    let server = setup_test_server();
    let client = Client::new();

    let res = client.get(server.url("/")).send().unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(res.text().unwrap(), "<h1>It works</h1>");

    let res = client.get(server.url("/not_found.txt")).send().unwrap();
    assert_eq!(res.status(), 404);
    let declared: usize = res.headers()["content-length"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = res.text().unwrap();
    assert_eq!(declared, body.len());
    assert!(!body.contains(server.temp_dir.path().to_str().unwrap()));

    let res = client.post(server.url("/test.txt")).send().unwrap();
    assert_eq!(res.status(), 405);
    assert_eq!(res.headers()["allow"], "GET, HEAD");
}

#[test]
fn test_query_string_is_ignored() {
    let server = setup_test_server();
    let client = Client::new();

    let res = client.get(server.url("/test.txt?v=42")).send().unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().unwrap().as_ref(), server.contents.as_slice());
}

#[test]
fn test_empty_request() {
    let server = setup_test_server();
    let _ = std::net::TcpStream::connect(server.addr).unwrap();
    // The connection is immediately closed here when the stream goes out of scope.
    // The server should handle this gracefully without panicking.
}
