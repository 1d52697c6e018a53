//! Fixture HTTP server used by the supervisor's integration tests.
//!
//! Environment variables:
//! - PORT: port to listen on (required)
//! - STARTUP_DELAY_MS: delay before binding the listener (default: 0)
//! - UNHEALTHY: if set, `/health` always returns 500
//! - IGNORE_SIGTERM: if set, SIGTERM is ignored so the process must be force-killed

use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

static IN_FLIGHT: AtomicU32 = AtomicU32::new(0);

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let unhealthy = env::var("UNHEALTHY").is_ok();
    let ignore_sigterm = env::var("IGNORE_SIGTERM").is_ok();

    if startup_delay > 0 {
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    if ignore_sigterm {
        tokio::spawn(async {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler");
            loop {
                term.recv().await;
                eprintln!("mock-app: ignoring SIGTERM");
            }
        });
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{port}"))
        .await
        .expect("failed to bind");

    eprintln!("mock-app: listening on {port}, pid={}", std::process::id());

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_connection(stream, unhealthy));
            }
            Err(e) => {
                eprintln!("mock-app: accept error: {e}");
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, unhealthy: bool) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request_str = match std::str::from_utf8(&buf) {
        Ok(s) => s,
        Err(_) => return,
    };
    let request_line = request_str.lines().next().unwrap_or("GET / HTTP/1.1");
    let path = request_line.split(' ').nth(1).unwrap_or("/");

    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);

    let (status, body) = match path {
        "/health" if unhealthy => ("500 Internal Server Error", "unhealthy".to_string()),
        "/health" => ("200 OK", "ok".to_string()),
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            ("200 OK", "slow response".to_string())
        }
        "/in-flight" => ("200 OK", IN_FLIGHT.load(Ordering::SeqCst).to_string()),
        "/pid" => ("200 OK", std::process::id().to_string()),
        "/headers" => {
            let headers: String = request_str
                .lines()
                .skip(1)
                .take_while(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            ("200 OK", headers)
        }
        _ => ("200 OK", format!("pid={}", std::process::id())),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );

    let _ = stream.write_all(response.as_bytes()).await;
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}
