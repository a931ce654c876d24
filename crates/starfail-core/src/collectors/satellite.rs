//! Satellite dish collector: reachability plus enhanced health fields pulled
//! from the dish's local management API (obstruction, SNR, PoP latency,
//! outage/reboot flags), matching the field names that API has used publicly
//! for years so operators reading a capture recognize them immediately.

use serde::Deserialize;

use crate::config::SatelliteConfig;
use crate::model::{ClassFields, Member, Sample, SatelliteFields};
use crate::transport::{call_typed, Transport};

use super::common::{reachability_probe, JitterTrackers};

pub struct SatelliteCollector {
    transport: Option<Box<dyn Transport>>,
    targets: Vec<String>,
    jitter: JitterTrackers,
}

impl SatelliteCollector {
    pub fn new(transport: Option<Box<dyn Transport>>, satellite_cfg: &SatelliteConfig) -> Self {
        SatelliteCollector {
            transport,
            targets: vec![satellite_cfg.dish_ip.clone()],
            jitter: JitterTrackers::new(),
        }
    }

    pub async fn collect(&self, member: &Member, now_ms: u64, timeout_ms: u64) -> Sample {
        let (latency_ms, loss_pct) = reachability_probe(&self.targets, timeout_ms).await;
        let jitter_ms = latency_ms
            .map(|l| self.jitter.observe(&member.name, l))
            .unwrap_or(0.0);

        let fields = match &self.transport {
            Some(t) => self.fetch_status(t.as_ref(), timeout_ms).await,
            None => None,
        };

        Sample {
            timestamp_ms: now_ms,
            latency_ms,
            loss_pct,
            jitter_ms,
            class_fields: ClassFields::Satellite(fields.unwrap_or_default()),
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

    async fn fetch_status(&self, transport: &dyn Transport, timeout_ms: u64) -> Option<SatelliteFields> {
        let status: DishStatus =
            call_typed(transport, "satellite", "get_status", serde_json::json!({}), timeout_ms)
                .await
                .ok()?;
        let diagnostics: Option<DishDiagnostics> = call_typed(
            transport,
            "satellite",
            "get_diagnostics",
            serde_json::json!({}),
            timeout_ms,
        )
        .await
        .ok();

        Some(SatelliteFields {
            obstruction_pct: Some(status.obstruction_fraction * 100.0),
            snr_db: status.snr_db,
            snr_above_noise: Some(status.is_snr_above_noise_floor),
            snr_persistently_low: Some(status.is_snr_persistently_low),
            pop_ping_latency_ms: Some(status.pop_ping_latency_ms),
            outage_in_progress: Some(status.currently_obstructed || status.outage_active),
            reboot_ready: Some(status.swupdate_reboot_ready),
            thermal_throttle: diagnostics.map(|d| d.thermal_throttle),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DishStatus {
    obstruction_fraction: f64,
    snr_db: Option<f64>,
    is_snr_above_noise_floor: bool,
    is_snr_persistently_low: bool,
    pop_ping_latency_ms: f64,
    currently_obstructed: bool,
    outage_active: bool,
    swupdate_reboot_ready: bool,
}

#[derive(Debug, Deserialize)]
struct DishDiagnostics {
    thermal_throttle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Class;

    #[tokio::test]
    async fn collect_without_transport_yields_reachability_only() {
        let cfg = SatelliteConfig {
            dish_ip: "127.0.0.1".to_string(),
            dish_port: 1,
        };
        let collector = SatelliteCollector::new(None, &cfg);
        let member = Member::new("starlink", Class::Satellite, "eth1");
        let sample = collector.collect(&member, 1_000, 50).await;
        assert!(matches!(sample.class_fields, ClassFields::Satellite(f) if f.obstruction_pct.is_none()));
    }
}
