//! Minimal HTTP/1.1 server that accepts POST uploads for integration tests.
//!
//! Reads the request head, honors `Expect: 100-continue`, consumes
//! `Content-Length` bytes of body, and records what it saw. Can be told to
//! reject the first N uploads with a 500.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// One upload as the server saw it.
#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    /// Header (name, value) pairs, names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedUpload {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct UploadServer {
    pub received: Mutex<Vec<ReceivedUpload>>,
    fail_remaining: AtomicU32,
}

impl UploadServer {
    /// Starts a server in a background thread; the first `fail_first`
    /// uploads are rejected with a 500. Returns (server, endpoint URL).
    /// The server runs until the process exits.
    pub fn start(fail_first: u32) -> (Arc<Self>, String) {
        let server = Arc::new(UploadServer {
            received: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(fail_first),
        });
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let handle = Arc::clone(&server);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let handle = Arc::clone(&handle);
                thread::spawn(move || handle_connection(stream, &handle));
            }
        });
        (server, format!("http://127.0.0.1:{}/upload", port))
    }
}

fn handle_connection(mut stream: std::net::TcpStream, server: &UploadServer) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));

    // Read until the end of the request head.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
    };

    let head = match std::str::from_utf8(&buf[..head_end]) {
        Ok(s) => s.to_string(),
        Err(_) => return,
    };
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or("");
    if !request_line.starts_with("POST") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    let mut expects_continue = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            if name == "expect" && value.to_ascii_lowercase().contains("100-continue") {
                expects_continue = true;
            }
            headers.push((name, value));
        }
    }

    if expects_continue {
        let _ = stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n");
    }

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
    }
    body.truncate(content_length);

    let reject = server
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if reject {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    server
        .received
        .lock()
        .unwrap()
        .push(ReceivedUpload { headers, body });
    let _ = stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
