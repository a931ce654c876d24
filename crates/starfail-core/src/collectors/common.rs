//! Shared reachability probing and jitter tracking used by every
//! class-specific collector.
//!
//! Reachability prefers ICMP (shelling out to the system `ping` binary — no
//! raw sockets without `CAP_NET_RAW`), falls back to TCP-connect timing, then
//! a bare UDP send as a last resort when nothing else gets through a
//! restrictive firewall.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tokio::process::Command;
use tokio::time::timeout;

use crate::stats::stddev;

/// Number of recent latency samples kept per member for jitter (section 4.1:
/// "jitter is the standard deviation of the last 16 latency samples").
pub const JITTER_WINDOW: usize = 16;

/// Per-member ring of recent latencies feeding [`stddev`] for jitter.
#[derive(Default)]
pub struct JitterTrackers {
    by_member: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl JitterTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `latency_ms` for `member` and return the current jitter.
    pub fn observe(&self, member: &str, latency_ms: f64) -> f64 {
        let mut map = self.by_member.lock().unwrap();
        let buf = map.entry(member.to_string()).or_default();
        buf.push_back(latency_ms);
        if buf.len() > JITTER_WINDOW {
            buf.pop_front();
        }
        let values: Vec<f64> = buf.iter().copied().collect();
        stddev(&values)
    }

    pub fn forget(&self, member: &str) {
        self.by_member.lock().unwrap().remove(member);
    }
}

/// Reachability probe: returns `(latency_ms, loss_pct)`. `loss_pct` is only
/// meaningfully fractional when the ICMP path ran (it reports the measured
/// packet loss from a small ping burst); the TCP and UDP fallbacks can only
/// observe binary reachability, so they report 0 or 100.
pub async fn reachability_probe(targets: &[String], timeout_ms: u64) -> (Option<f64>, f64) {
    if let Some(result) = probe_icmp(targets, timeout_ms).await {
        return result;
    }
    if let Some(latency) = probe_tcp(targets, timeout_ms).await {
        return (Some(latency), 0.0);
    }
    if let Some(latency) = probe_udp(targets, timeout_ms).await {
        return (Some(latency), 0.0);
    }
    (None, 100.0)
}

async fn probe_icmp(targets: &[String], timeout_ms: u64) -> Option<(Option<f64>, f64)> {
    let target = targets.first()?;
    let timeout_s = ((timeout_ms as f64) / 1000.0).max(1.0);
    let fut = Command::new("ping")
        .args(["-c", "3", "-W", &timeout_s.to_string(), target])
        .output();
    let output = timeout(Duration::from_millis(timeout_ms + 500), fut).await.ok()?.ok()?;
    if output.stdout.is_empty() {
        return None; // binary missing or produced nothing usable; fall back
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&text)
}

/// Parses iputils-style `ping` summary output:
/// `3 packets transmitted, 2 received, 33.3333% packet loss`
/// `rtt min/avg/max/mdev = 10.1/12.3/15.0/1.2 ms`
fn parse_ping_output(text: &str) -> Option<(Option<f64>, f64)> {
    let mut loss_pct = 100.0;
    let mut avg_ms = None;
    let mut saw_summary = false;

    for line in text.lines() {
        if let Some(idx) = line.find("% packet loss") {
            let start = line[..idx].rfind(' ').map(|i| i + 1).unwrap_or(0);
            if let Ok(v) = line[start..idx].parse() {
                loss_pct = v;
                saw_summary = true;
            }
        }
        if let Some(rest) = line.trim().strip_prefix("rtt min/avg/max/mdev = ") {
            if let Some(values) = rest.split_whitespace().next() {
                let parts: Vec<&str> = values.split('/').collect();
                if parts.len() >= 2 {
                    avg_ms = parts[1].parse().ok();
                }
            }
        }
    }

    if !saw_summary {
        return None;
    }
    Some((avg_ms, loss_pct))
}

async fn probe_tcp(targets: &[String], timeout_ms: u64) -> Option<f64> {
    for target in targets {
        let addr = if target.contains(':') {
            target.clone()
        } else {
            format!("{target}:443")
        };
        let start = Instant::now();
        if let Ok(Ok(_)) = timeout(Duration::from_millis(timeout_ms), TcpStream::connect(&addr)).await {
            return Some(start.elapsed().as_secs_f64() * 1000.0);
        }
    }
    None
}

async fn probe_udp(targets: &[String], timeout_ms: u64) -> Option<f64> {
    let target = targets.first()?;
    let addr = if target.contains(':') {
        target.clone()
    } else {
        format!("{target}:53")
    };
    let start = Instant::now();
    let fut = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(&addr).await.ok()?;
        socket.send(&[0u8; 8]).await.ok()?;
        Some(())
    };
    timeout(Duration::from_millis(timeout_ms), fut).await.ok()??;
    Some(start.elapsed().as_secs_f64() * 1000.0)
}

/// Per-`data_cap_mode` cadence: a base cadence multiplier plus a flat ×2 for
/// metered members regardless of mode (section 4.2: "metered links obey
/// data_cap_mode even more strictly").
pub fn cadence_ms(base_poll_ms: u64, mode: crate::config::DataCapMode, metered: bool) -> u64 {
    let mult = mode.cadence_multiplier() * if metered { 2.0 } else { 1.0 };
    (base_poll_ms as f64 * mult) as u64
}
