//! relaunchctl - command-line client for the relaunch admin API.
//!
//! Usage:
//!   relaunchctl status            Show every app and its instances
//!   relaunchctl start <app>       Start a new instance of an app
//!   relaunchctl stop <app>        Stop all instances of an app

use anyhow::{Context, Result};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:9000";

struct ApiClient {
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    fn new() -> Self {
        let base_url = env::var("RELAUNCH_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let token = env::var("RELAUNCH_API_TOKEN").ok();
        Self { base_url, token }
    }

    fn request(&self, method: &str, path: &str) -> Result<(u16, String)> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.strip_prefix("http://").unwrap_or(&url);
        let (host_port, path) = match url.find('/') {
            Some(idx) => (&url[..idx], &url[idx..]),
            None => (url, "/"),
        };

        let mut stream = TcpStream::connect(host_port)
            .context(format!("failed to connect to admin API at {}", self.base_url))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        let auth_header = match &self.token {
            Some(token) => format!("Authorization: Bearer {}\r\n", token),
            None => String::new(),
        };

        let request = format!(
            "{method} {path} HTTP/1.1\r\n\
             Host: {host_port}\r\n\
             {auth_header}\
             Connection: close\r\n\
             \r\n"
        );

        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);

        let body = match response.find("\r\n\r\n") {
            Some(idx) => response[idx + 4..].to_string(),
            None => response,
        };

        Ok((status, body))
    }

    fn get(&self, path: &str) -> Result<(u16, String)> {
        self.request("GET", path)
    }

    fn post(&self, path: &str) -> Result<(u16, String)> {
        self.request("POST", path)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let client = ApiClient::new();

    match args.get(1).map(String::as_str) {
        Some("status") => cmd_status(&client),
        Some("start") => cmd_start(&client, args.get(2)),
        Some("stop") => cmd_stop(&client, args.get(2)),
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn cmd_status(client: &ApiClient) -> Result<()> {
    let (status, body) = client.get("/status")?;
    if status != 200 {
        println!("admin API returned {status}: {body}");
        return Ok(());
    }

    let parsed: serde_json::Value = serde_json::from_str(&body).context("failed to parse status response")?;
    let apps = parsed.as_array().context("expected an array of apps")?;

    if apps.is_empty() {
        println!("no apps configured");
        return Ok(());
    }

    for app in apps {
        let name = app.get("name").and_then(|v| v.as_str()).unwrap_or("?");
        println!("{name}");
        let instances = app.get("instances").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        if instances.is_empty() {
            println!("  (no instances)");
            continue;
        }
        for instance in instances {
            let id = instance.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
            let port = instance.get("port").and_then(|v| v.as_u64()).unwrap_or(0);
            let status = instance.get("status").and_then(|v| v.as_str()).unwrap_or("?");
            let in_flight = instance.get("in_flight").and_then(|v| v.as_u64()).unwrap_or(0);
            let active = instance.get("active").and_then(|v| v.as_bool()).unwrap_or(false);
            let last_change = instance.get("last_change_secs_ago").and_then(|v| v.as_u64()).unwrap_or(0);
            println!(
                "  #{id} port={port} status={status} in_flight={in_flight} last_change={last_change}s ago{}",
                if active { " (active)" } else { "" }
            );
        }
    }

    Ok(())
}

fn cmd_start(client: &ApiClient, app: Option<&String>) -> Result<()> {
    let app = match app {
        Some(app) => app,
        None => {
            println!("usage: relaunchctl start <app>");
            return Ok(());
        }
    };

    let (status, body) = client.post(&format!("/apps/{app}/start"))?;
    match status {
        200 => println!("started new instance of {app}: {body}"),
        404 => println!("unknown app: {app}"),
        503 => println!("ports exhausted, cannot start {app}"),
        _ => println!("failed to start {app}: {status} {body}"),
    }

    Ok(())
}

fn cmd_stop(client: &ApiClient, app: Option<&String>) -> Result<()> {
    let app = match app {
        Some(app) => app,
        None => {
            println!("usage: relaunchctl stop <app>");
            return Ok(());
        }
    };

    let (status, body) = client.post(&format!("/apps/{app}/stop"))?;
    match status {
        200 => println!("stopped all instances of {app}"),
        404 => println!("unknown app: {app}"),
        _ => println!("failed to stop {app}: {status} {body}"),
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"relaunchctl - control a running relaunch supervisor

USAGE:
    relaunchctl <command>

COMMANDS:
    status            Show every app and its instances
    start <app>       Start a new instance of an app
    stop <app>        Stop all instances of an app

ENVIRONMENT:
    RELAUNCH_API_URL      Admin API endpoint (default: http://127.0.0.1:9000)
    RELAUNCH_API_TOKEN    Bearer token for the admin API
"#
    );
}
