//! LAN (and "other") collector: reachability only, no class-specific
//! telemetry to fetch.

use crate::model::{ClassFields, Member, Sample};

use super::common::{reachability_probe, JitterTrackers};

pub struct LanCollector {
    targets: Vec<String>,
    jitter: JitterTrackers,
}

impl LanCollector {
    pub fn new(targets: Vec<String>) -> Self {
        LanCollector {
            targets,
            jitter: JitterTrackers::new(),
        }
    }

    pub async fn collect(&self, member: &Member, now_ms: u64, timeout_ms: u64) -> Sample {
        let (latency_ms, loss_pct) = reachability_probe(&self.targets, timeout_ms).await;
        let jitter_ms = latency_ms
            .map(|l| self.jitter.observe(&member.name, l))
            .unwrap_or(0.0);

        Sample {
            timestamp_ms: now_ms,
            latency_ms,
            loss_pct,
            jitter_ms,
            class_fields: ClassFields::None,
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
