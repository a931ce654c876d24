//! Wi-Fi collector: reachability plus signal fields from `iw dev <iface>
//! link`, falling back to `/proc/net/wireless` on hosts without `iw` — the
//! same fixed-width text format the signal-watermark code elsewhere in this
//! dependency tree already parses.

use crate::model::{ClassFields, Member, Sample, WifiFields};

use super::common::{reachability_probe, JitterTrackers};

pub struct WifiCollector {
    targets: Vec<String>,
    jitter: JitterTrackers,
}

impl WifiCollector {
    pub fn new(targets: Vec<String>) -> Self {
        WifiCollector {
            targets,
            jitter: JitterTrackers::new(),
        }
    }

    pub async fn collect(&self, member: &Member, now_ms: u64, timeout_ms: u64) -> Sample {
        let (latency_ms, loss_pct) = reachability_probe(&self.targets, timeout_ms).await;
        let jitter_ms = latency_ms
            .map(|l| self.jitter.observe(&member.name, l))
            .unwrap_or(0.0);

        let fields = read_iw_link(&member.interface)
            .await
            .or_else(|| read_proc_net_wireless(&member.interface));

        Sample {
            timestamp_ms: now_ms,
            latency_ms,
            loss_pct,
            jitter_ms,
            class_fields: ClassFields::Wifi(fields.unwrap_or_default()),
            instant: 0.0,
            ewma: 0.0,
            window_avg: 0.0,
            r#final: 0.0,
            stale: false,
        }
    }

    pub fn forget(&self, member: &str) {
        self.jitter.forget(member);
    }
}

async fn read_iw_link(interface: &str) -> Option<WifiFields> {
    let output = tokio::process::Command::new("iw")
        .args(["dev", interface, "link"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_iw_link(&String::from_utf8_lossy(&output.stdout))
}

fn parse_iw_link(text: &str) -> Option<WifiFields> {
    if text.contains("Not connected.") {
        return None;
    }

    let mut fields = WifiFields {
        mode: Some("station".to_string()),
        ..Default::default()
    };
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("signal:") {
            fields.signal_dbm = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("tx bitrate:") {
            fields.bitrate_mbps = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok());
        }
    }
    if text.contains("type AP") {
        fields.mode = Some("tether".to_string());
    }
    Some(fields)
}

/// Fixed-column fallback: `iface: status level. noise. nwid crypt ...`.
fn read_proc_net_wireless(interface: &str) -> Option<WifiFields> {
    let contents = std::fs::read_to_string("/proc/net/wireless").ok()?;
    parse_proc_net_wireless(&contents, interface)
}

fn parse_proc_net_wireless(text: &str, interface: &str) -> Option<WifiFields> {
    for line in text.lines().skip(2) {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix(interface) else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let signal = fields[1].trim_end_matches('.').parse::<f64>().ok();
        let noise = fields[2].trim_end_matches('.').parse::<f64>().ok();
        return Some(WifiFields {
            signal_dbm: signal,
            noise_dbm: noise,
            snr_db: match (signal, noise) {
                (Some(s), Some(n)) => Some(s - n),
                _ => None,
            },
            bitrate_mbps: None,
            mode: Some("station".to_string()),
        });
    }
    None
}
