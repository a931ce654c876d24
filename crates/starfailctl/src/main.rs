//! Command-line client for `starfaild`'s local RPC API.
//!
//! A plain HTTP client against the router in `starfail_core::rpc` — it never
//! duplicates routing or scoring logic, only serializes requests and renders
//! responses. Exit codes: `0` success, `1` generic error, `2` invalid
//! argument, `3` RPC unreachable, `4` action throttled.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Control client for the starfaild failover daemon.
#[derive(Parser, Debug)]
#[command(name = "starfailctl", version = VERSION, about = "Control client for starfaild")]
struct Cli {
    /// Daemon RPC address.
    #[arg(long, default_value = "127.0.0.1:9101")]
    rpc_addr: String,

    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 3_000)]
    timeout_ms: u64,

    /// Print raw JSON instead of a rendered table.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Current primary, ranking, and last event.
    Status,
    /// All configured members and their eligibility.
    Members,
    /// Recent samples for one member.
    Metrics { name: String },
    /// Samples for one member since `since_s` seconds ago (default 300).
    History { name: String, since_s: Option<u64> },
    /// Recent events (default 50).
    Events { limit: Option<usize> },
    /// Force failover to a member.
    Failover { name: String },
    /// Acknowledge restoration of the previous primary.
    Restore,
    /// Request an out-of-cycle recheck.
    Recheck,
    /// Change the live log level without a restart.
    Setlog { level: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(cli.timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to build HTTP client: {e}");
            return ExitCode::from(1);
        }
    };

    let base = format!("http://{}", cli.rpc_addr);

    let result = match &cli.command {
        Command::Status => get(&client, &base, "/status"),
        Command::Members => get(&client, &base, "/members"),
        Command::Metrics { name } => {
            if name.trim().is_empty() {
                return invalid_argument("metrics requires a non-empty member name");
            }
            get(&client, &base, &format!("/metrics/{name}"))
        }
        Command::History { name, since_s } => {
            if name.trim().is_empty() {
                return invalid_argument("history requires a non-empty member name");
            }
            let path = match since_s {
                Some(s) => format!("/history/{name}?since_s={s}"),
                None => format!("/history/{name}"),
            };
            get(&client, &base, &path)
        }
        Command::Events { limit } => {
            let path = match limit {
                Some(n) => format!("/events?limit={n}"),
                None => "/events".to_string(),
            };
            get(&client, &base, &path)
        }
        Command::Failover { name } => {
            if name.trim().is_empty() {
                return invalid_argument("failover requires a non-empty member name");
            }
            post(&client, &base, "/action", serde_json::json!({"cmd": "failover", "name": name}))
        }
        Command::Restore => post(&client, &base, "/action", serde_json::json!({"cmd": "restore"})),
        Command::Recheck => post(&client, &base, "/action", serde_json::json!({"cmd": "recheck"})),
        Command::Setlog { level } => {
            let level = level.to_ascii_lowercase();
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
                return invalid_argument(&format!("unknown log level '{level}'"));
            }
            post(&client, &base, "/loglevel", serde_json::json!({"level": level}))
        }
    };

    match result {
        Ok(body) => {
            render(&body, cli.json, &cli.command);
            ExitCode::from(0)
        }
        Err(CtlError::Unreachable(detail)) => {
            eprintln!("error: could not reach starfaild at {}: {detail}", cli.rpc_addr);
            ExitCode::from(3)
        }
        Err(CtlError::Throttled(detail)) => {
            eprintln!("error: action throttled: {detail}");
            ExitCode::from(4)
        }
        Err(CtlError::Rejected(status, detail)) => {
            eprintln!("error: starfaild rejected the request ({status}): {detail}");
            ExitCode::from(1)
        }
    }
}

fn invalid_argument(detail: &str) -> ExitCode {
    eprintln!("error: {detail}");
    ExitCode::from(2)
}

enum CtlError {
    Unreachable(String),
    Throttled(String),
    Rejected(u16, String),
}

fn get(client: &reqwest::blocking::Client, base: &str, path: &str) -> Result<Value, CtlError> {
    let response = client
        .get(format!("{base}{path}"))
        .send()
        .map_err(|e| CtlError::Unreachable(e.to_string()))?;
    parse_response(response)
}

fn post(client: &reqwest::blocking::Client, base: &str, path: &str, body: Value) -> Result<Value, CtlError> {
    let response = client
        .post(format!("{base}{path}"))
        .json(&body)
        .send()
        .map_err(|e| CtlError::Unreachable(e.to_string()))?;
    parse_response(response)
}

fn parse_response(response: reqwest::blocking::Response) -> Result<Value, CtlError> {
    let status = response.status();
    let body: Value = response
        .json()
        .unwrap_or_else(|_| serde_json::json!({"error": "decode_error", "detail": "non-JSON response body"}));

    if status.is_success() {
        return Ok(body);
    }

    let detail = body
        .get("detail")
        .and_then(|v| v.as_str())
        .unwrap_or("no detail provided")
        .to_string();

    if status.as_u16() == 429 {
        return Err(CtlError::Throttled(detail));
    }
    Err(CtlError::Rejected(status.as_u16(), detail))
}

fn render(body: &Value, as_json: bool, command: &Command) {
    if as_json {
        println!("{}", serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string()));
        return;
    }

    match command {
        Command::Status => render_status(body),
        Command::Members => render_members(body),
        Command::Metrics { .. } | Command::History { .. } => render_samples(body),
        Command::Events { .. } => render_events(body),
        Command::Failover { .. } | Command::Restore | Command::Recheck | Command::Setlog { .. } => {
            println!("{}", serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string()));
        }
    }
}

fn render_status(body: &Value) {
    let primary = body.get("primary").and_then(|v| v.as_str()).unwrap_or("<none>");
    println!("primary: {primary}");
    println!("config_digest: {}", body.get("config_digest").and_then(|v| v.as_str()).unwrap_or(""));
    if let Some(ranking) = body.get("ranking").and_then(|v| v.as_array()) {
        println!("ranking:");
        for entry in ranking {
            let name = entry.get("name").and_then(|v| v.as_str()).unwrap_or("?");
            let score = entry.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            println!("  {name:<16} {score:>6.1}");
        }
    }
    if let Some(event) = body.get("last_event") {
        if !event.is_null() {
            println!("last_event: {}", event.get("reason").and_then(|v| v.as_str()).unwrap_or(""));
        }
    }
}

fn render_members(body: &Value) {
    let Some(members) = body.as_array() else { return };
    println!("{:<16} {:<10} {:<7} {:<9} {:<9} {:<9}", "NAME", "CLASS", "WEIGHT", "ELIGIBLE", "WARMUP", "COOLDOWN");
    for member in members {
        println!(
            "{:<16} {:<10} {:<7} {:<9} {:<9} {:<9}",
            member.get("name").and_then(|v| v.as_str()).unwrap_or("?"),
            member.get("class").and_then(|v| v.as_str()).unwrap_or("?"),
            member.get("weight").and_then(|v| v.as_u64()).unwrap_or(0),
            member.get("eligible").and_then(|v| v.as_bool()).unwrap_or(false),
            member.get("in_warmup").and_then(|v| v.as_bool()).unwrap_or(false),
            member.get("in_cooldown").and_then(|v| v.as_bool()).unwrap_or(false),
        );
    }
}

fn render_samples(body: &Value) {
    let Some(samples) = body.as_array() else { return };
    println!("{:<14} {:<9} {:<8} {:<8} {:<8}", "TIMESTAMP", "LATENCY", "LOSS%", "JITTER", "FINAL");
    for sample in samples {
        let latency = sample
            .get("latency_ms")
            .and_then(|v| v.as_f64())
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<9} {:<8.1} {:<8.1} {:<8.1}",
            sample.get("timestamp_ms").and_then(|v| v.as_u64()).unwrap_or(0),
            latency,
            sample.get("loss_pct").and_then(|v| v.as_f64()).unwrap_or(0.0),
            sample.get("jitter_ms").and_then(|v| v.as_f64()).unwrap_or(0.0),
            sample.get("final").and_then(|v| v.as_f64()).unwrap_or(0.0),
        );
    }
}

fn render_events(body: &Value) {
    let Some(events) = body.as_array() else { return };
    for event in events {
        println!(
            "{} {:<16} {}",
            event.get("timestamp_ms").and_then(|v| v.as_u64()).unwrap_or(0),
            event.get("kind").and_then(|v| v.as_str()).unwrap_or("?"),
            event.get("reason").and_then(|v| v.as_str()).unwrap_or(""),
        );
    }
}
