//! Minimal HTTP/1.1 segment server for integration tests.
//!
//! Serves static bodies by path with Range GET support. Routes can delay
//! their responses or cut the first N responses short after announcing the
//! full Content-Length. Peak concurrency and every request are recorded.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Route {
    pub body: Vec<u8>,
    /// Sleep before answering.
    pub delay: Duration,
    /// Number of initial GETs that stop after `truncate_to` body bytes.
    pub truncate_first: usize,
    pub truncate_to: usize,
    /// Status for every response instead of the body.
    pub status: Option<u16>,
}

impl Route {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            delay: Duration::ZERO,
            truncate_first: 0,
            truncate_to: 0,
            status: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn truncated(mut self, times: usize, to: usize) -> Self {
        self.truncate_first = times;
        self.truncate_to = to;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub path: String,
    /// Start of `Range: bytes=N-`, if the request carried one.
    pub range_start: Option<u64>,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, (Route, usize)>>,
    requests: Mutex<Vec<RequestRecord>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

pub struct SegmentServer {
    base: String,
    state: Arc<ServerState>,
}

impl SegmentServer {
    /// Start serving `routes` (path without leading slash) on a background
    /// thread. The server runs until the process exits.
    pub fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());
        {
            let mut map = state.routes.lock().unwrap();
            for (path, route) in routes {
                map.insert(path.trim_start_matches('/').to_string(), (route, 0));
            }
        }
        let served = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = Arc::clone(&served);
                thread::spawn(move || handle(stream, &state));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{}/", port),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }

    /// Highest number of requests served at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<RequestRecord> {
        let path = path.trim_start_matches('/');
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }
}

fn handle(mut stream: TcpStream, state: &ServerState) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, path, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    state.requests.lock().unwrap().push(RequestRecord {
        path: path.clone(),
        range_start: range,
    });

    let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(now, Ordering::SeqCst);
    respond(&mut stream, state, &path, range);
    state.active.fetch_sub(1, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
}

fn respond(stream: &mut TcpStream, state: &ServerState, path: &str, range: Option<u64>) {
    let (route, served) = {
        let mut routes = state.routes.lock().unwrap();
        match routes.get_mut(path) {
            Some((route, count)) => {
                *count += 1;
                (route.clone(), *count)
            }
            None => {
                let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                return;
            }
        }
    };
    if !route.delay.is_zero() {
        thread::sleep(route.delay);
    }
    if let Some(status) = route.status {
        let response = format!(
            "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let total = route.body.len() as u64;
    let (status, content_range, slice) = match range {
        Some(start) if start >= total => {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                total
            );
            let _ = stream.write_all(response.as_bytes());
            return;
        }
        Some(start) => (
            "206 Partial Content",
            format!("Content-Range: bytes {}-{}/{}\r\n", start, total - 1, total),
            &route.body[start as usize..],
        ),
        None => ("200 OK", String::new(), &route.body[..]),
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}Accept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        status,
        slice.len(),
        content_range
    );
    let _ = stream.write_all(response.as_bytes());
    if served <= route.truncate_first {
        let cut = route.truncate_to.min(slice.len());
        let _ = stream.write_all(&slice[..cut]);
        let _ = stream.flush();
        return;
    }
    let _ = stream.write_all(slice);
}

/// Returns (method, path, optional start of `Range: bytes=N-`).
fn parse_request(request: &str) -> (String, String, Option<u64>) {
    let mut method = String::new();
    let mut path = String::new();
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("").to_string();
            path = parts.next().unwrap_or("/").trim_start_matches('/').to_string();
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(ranges) = value.strip_prefix("bytes=") {
                    if let Some((a, _)) = ranges.split_once('-') {
                        range = a.trim().parse::<u64>().ok();
                    }
                }
            }
        }
    }
    (method, path, range)
}
