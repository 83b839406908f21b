use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("timed out waiting for websocket frame")]
    Timeout,
    #[error("server rejected request (HTTP {status}, {code}): {message}")]
    ServerError { status: u16, code: String, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "qnet-cli", about = "Quantum network control panel CLI")]
struct Cli {
    #[arg(long, env = "QNET_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server is up.
    Ping,
    /// Print the full panel snapshot.
    Panel,
    /// Send a message over a simulated QKD channel.
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        message: String,
    },
    /// Create an entangled pair between two nodes.
    Entangle { node_a: String, node_b: String },
    /// Submit a circuit to the distributed job queue.
    Submit { circuit: String },
    /// Stream panel events until interrupted.
    Watch {
        #[arg(long, help = "Stop after this many pushed frames")]
        count: Option<usize>,
        #[arg(long, default_value_t = 0, help = "Idle timeout in seconds, 0 for none")]
        idle_secs: u64,
    },
}

/// Inbound websocket frame. Only the fields the CLI prints.
#[derive(Debug, Deserialize)]
struct Frame {
    syscall: String,
    status: String,
    #[serde(default)]
    data: Map<String, Value>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let base_url = cli.base_url.trim_end_matches('/').to_owned();

    match cli.command {
        Command::Ping => run_ping(&base_url).await,
        Command::Panel => {
            let json = api_request(&base_url, reqwest::Method::GET, "/api/panel", None).await?;
            print_json(&json)
        }
        Command::Send { from, to, message } => {
            let body = json!({ "sender": from, "recipient": to, "message": message });
            let json = api_request(&base_url, reqwest::Method::POST, "/api/qkd/messages", Some(body)).await?;
            print_json(&json)
        }
        Command::Entangle { node_a, node_b } => {
            let body = json!({ "node_a": node_a, "node_b": node_b });
            let json = api_request(&base_url, reqwest::Method::POST, "/api/entanglements", Some(body)).await?;
            print_json(&json)
        }
        Command::Submit { circuit } => {
            let body = json!({ "circuit": circuit });
            let json = api_request(&base_url, reqwest::Method::POST, "/api/jobs", Some(body)).await?;
            print_json(&json)
        }
        Command::Watch { count, idle_secs } => run_watch(&base_url, count, idle_secs).await,
    }
}

async fn run_ping(base_url: &str) -> Result<(), CliError> {
    let response = reqwest::Client::new()
        .get(format!("{base_url}/healthz"))
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            status: status.as_u16(),
            code: "-".to_owned(),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

async fn run_watch(base_url: &str, count: Option<usize>, idle_secs: u64) -> Result<(), CliError> {
    let (mut stream, _) = connect_async(ws_url(base_url)?)
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    let idle = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));
    let mut seen = 0_usize;
    loop {
        let next = match idle {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| CliError::Timeout)?,
            None => stream.next().await,
        };
        let Some(message) = next else {
            return Err(CliError::WsClosed);
        };
        match message.map_err(|error| CliError::WsConnect(Box::new(error)))? {
            Message::Text(text) => {
                let frame = serde_json::from_str::<Frame>(text.as_str())?;
                println!("{}", render_frame(&frame));
                seen = seen.saturating_add(1);
                if count.is_some_and(|limit| seen >= limit) {
                    return Ok(());
                }
            }
            Message::Close(_) => return Err(CliError::WsClosed),
            _ => {}
        }
    }
}

async fn api_request(
    base_url: &str,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value, CliError> {
    let client = reqwest::Client::new();
    let request = client.request(method, format!("{base_url}{path}"));
    let request = if let Some(json) = body {
        request.json(&json)
    } else {
        request
    };

    let response = request.send().await?;
    let status = response.status();
    let value = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError {
            status: status.as_u16(),
            code: value
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("-")
                .to_owned(),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| value.to_string(), ToOwned::to_owned),
        });
    }

    Ok(value)
}

fn ws_url(base_url: &str) -> Result<String, CliError> {
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws"));
    }
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws"));
    }

    Err(CliError::InvalidBaseUrl(base_url.to_owned()))
}

/// One line per frame. Log entries read like the panel feed.
fn render_frame(frame: &Frame) -> String {
    let field = |key| str_field(frame, key);
    match frame.syscall.as_str() {
        "log:append" => format!("[{}] {}", field("severity"), field("message")),
        "node:status" => format!("node {} -> {}", field("id"), field("status")),
        "gate:changed" => {
            let busy = frame
                .data
                .get("simulating")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!("simulating: {busy}")
        }
        _ if frame.status == "error" => format!("{} error: {}", frame.syscall, field("message")),
        _ => format!("{} {}", frame.syscall, Value::Object(frame.data.clone())),
    }
}

fn str_field<'a>(frame: &'a Frame, key: &str) -> &'a str {
    frame.data.get(key).and_then(Value::as_str).unwrap_or("")
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(syscall: &str, status: &str, data: Value) -> Frame {
        Frame {
            syscall: syscall.to_owned(),
            status: status.to_owned(),
            data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn ws_url_maps_scheme() {
        assert_eq!(ws_url("http://localhost:3000").expect("http"), "ws://localhost:3000/api/ws");
        assert_eq!(ws_url("https://panel.example").expect("https"), "wss://panel.example/api/ws");
        assert!(matches!(ws_url("ftp://x"), Err(CliError::InvalidBaseUrl(_))));
    }

    #[test]
    fn render_log_entry() {
        let f = frame("log:append", "request", json!({ "severity": "SUCCESS", "message": "ok" }));
        assert_eq!(render_frame(&f), "[SUCCESS] ok");
    }

    #[test]
    fn render_node_status_and_gate() {
        let f = frame("node:status", "request", json!({ "id": "node-beta", "status": "processing" }));
        assert_eq!(render_frame(&f), "node node-beta -> processing");

        let f = frame("gate:changed", "request", json!({ "simulating": true }));
        assert_eq!(render_frame(&f), "simulating: true");
    }

    #[test]
    fn render_error_frame() {
        let f = frame("job:submit", "error", json!({ "message": "busy" }));
        assert_eq!(render_frame(&f), "job:submit error: busy");
    }

    #[test]
    fn frame_without_data_parses() {
        let f: Frame = serde_json::from_str(r#"{"syscall":"panel:snapshot","status":"request"}"#).expect("parse");
        assert!(f.data.is_empty());
    }
}
