//! Prometheus scrape endpoint.
//!
//! A minimal blocking HTTP server on its own thread. Every request reads the
//! shared registry; nothing here writes to it.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::metrics::Registry;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind the metrics port and serve scrapes in a background thread.
/// Binding happens on the calling thread so a taken port fails startup.
pub fn start(bind: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .with_context(|| format!("Failed to bind metrics endpoint on {}", bind))?;

    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || serve(listener, &registry))
        .context("Failed to spawn metrics thread")?;

    info!("Serving metrics at http://{}/metrics", bind);
    Ok(())
}

fn serve(listener: TcpListener, registry: &Registry) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_request(stream, registry) {
                    debug!("Metrics request error: {}", e);
                }
            }
            Err(e) => warn!("Metrics accept error: {}", e),
        }
    }
    error!("Metrics listener closed");
}

fn handle_request(mut stream: TcpStream, registry: &Registry) -> std::io::Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Headers are unused, but must be consumed before the socket closes
    let mut header = String::new();
    while reader.read_line(&mut header)? > 0 && !header.trim().is_empty() {
        header.clear();
    }

    let mut parts = request_line.split_whitespace();
    let target = parts.next().zip(parts.next());
    let (status, body) = match target {
        None => (Status::BadRequest, "Invalid request line\n".to_string()),
        Some((method, _)) if method != "GET" => {
            (Status::MethodNotAllowed, format!("{} is not supported\n", method))
        }
        Some((_, path)) => match path.split('?').next() {
            Some("/" | "/metrics" | "/metrics/") => (Status::Ok, registry.render()),
            _ => (Status::NotFound, "Metrics are served at /metrics\n".to_string()),
        },
    };

    write_response(&mut stream, status, &body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::BadRequest => "400 Bad Request",
            Status::NotFound => "404 Not Found",
            Status::MethodNotAllowed => "405 Method Not Allowed",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Status::Ok => "text/plain; version=0.0.4; charset=utf-8",
            _ => "text/plain; charset=utf-8",
        }
    }
}

fn write_response(stream: &mut TcpStream, status: Status, body: &str) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.line(),
        status.content_type(),
        body.len()
    )?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Family, Phase};
    use std::io::Read;

    fn spawn_server(registry: Arc<Registry>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || serve(listener, &registry));
        addr
    }

    fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn scrape_returns_current_values() {
        let registry = Arc::new(Registry::new());
        registry.write().set(Family::Current, Phase::Total, 2.192);
        let addr = spawn_server(Arc::clone(&registry));

        let response = request(addr, "GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n"));
        assert!(response.contains("# TYPE energy_meter_current gauge\n"));
        assert!(response.contains("energy_meter_current{phase=\"total\"} 2.192\n"));

        // Later writes show up on the next scrape
        registry.write().set(Family::Current, Phase::Total, 3.5);
        let response = request(addr, "GET / HTTP/1.1\r\n\r\n");
        assert!(response.contains("energy_meter_current{phase=\"total\"} 3.5\n"));
    }

    #[test]
    fn unknown_path_and_method() {
        let addr = spawn_server(Arc::new(Registry::new()));

        let response = request(addr, "GET /favicon.ico HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(response.ends_with("Metrics are served at /metrics\n"));

        let response = request(addr, "POST /metrics HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.ends_with("POST is not supported\n"));

        let response = request(addr, "garbage\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn query_string_is_ignored() {
        let addr = spawn_server(Arc::new(Registry::new()));
        let response = request(addr, "GET /metrics?name[]=x HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
