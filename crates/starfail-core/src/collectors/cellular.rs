//! Cellular modem collector: reachability plus RF/network fields from the
//! system bus modem manager (native) or a CLI wrapper, with a best-effort
//! sysfs fallback when neither is reachable.

use serde::Deserialize;

use crate::model::{CellularFields, ClassFields, Member, Sample};
use crate::transport::{call_typed, Transport};

use super::common::{reachability_probe, JitterTrackers};

pub struct CellularCollector {
    transport: Option<Box<dyn Transport>>,
    targets: Vec<String>,
    jitter: JitterTrackers,
}

impl CellularCollector {
    pub fn new(transport: Option<Box<dyn Transport>>, targets: Vec<String>) -> Self {
        CellularCollector {
            transport,
            targets,
            jitter: JitterTrackers::new(),
        }
    }

    pub async fn collect(&self, member: &Member, now_ms: u64, timeout_ms: u64) -> Sample {
        let (latency_ms, loss_pct) = reachability_probe(&self.targets, timeout_ms).await;
        let jitter_ms = latency_ms
            .map(|l| self.jitter.observe(&member.name, l))
            .unwrap_or(0.0);

        // Section 4.2's fallback cascade: (1) the default modem provider's
        // signal query, (2) the same query under the alternative provider
        // name some modem managers register it under (`modem_manager`
        // rather than `cellular`), (3) the sysfs carrier-only fallback.
        let fields = match &self.transport {
            Some(t) => match self.fetch_modem_info(t.as_ref(), "cellular", &member.interface, timeout_ms).await {
                Some(f) => Some(f),
                None => {
                    self.fetch_modem_info(t.as_ref(), "modem_manager", &member.interface, timeout_ms)
                        .await
                }
            },
            None => None,
        }
        .or_else(|| read_sysfs_fallback(&member.interface));

        Sample {
            timestamp_ms: now_ms,
            latency_ms,
            loss_pct,
            jitter_ms,
            class_fields: ClassFields::Cellular(fields.unwrap_or_default()),
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

    async fn fetch_modem_info(
        &self,
        transport: &dyn Transport,
        provider: &str,
        interface: &str,
        timeout_ms: u64,
    ) -> Option<CellularFields> {
        let info: ModemInfo = call_typed(
            transport,
            provider,
            "get_signal",
            serde_json::json!({ "interface": interface }),
            timeout_ms,
        )
        .await
        .ok()?;

        Some(CellularFields {
            rsrp_dbm: info.rsrp_dbm,
            rsrq_db: info.rsrq_db,
            sinr_db: info.sinr_db,
            network_type: info.network_type,
            roaming: info.roaming,
            operator: info.operator,
            band: info.band,
            cell_id: info.cell_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ModemInfo {
    rsrp_dbm: Option<f64>,
    rsrq_db: Option<f64>,
    sinr_db: Option<f64>,
    network_type: Option<String>,
    roaming: Option<bool>,
    operator: Option<String>,
    band: Option<String>,
    cell_id: Option<String>,
}

/// Enumerate modem slots for multi-SIM hosts (one member per slot, named
/// `<base>_slot<id>` by the caller). Returns an empty list when no transport
/// is available — single-SIM is the common case and needs no enumeration.
pub async fn enumerate_modem_slots(transport: Option<&dyn Transport>, timeout_ms: u64) -> Vec<String> {
    let Some(transport) = transport else {
        return Vec::new();
    };

    #[derive(Debug, Deserialize)]
    struct SlotsResponse {
        slots: Vec<String>,
    }

    call_typed::<SlotsResponse>(transport, "cellular", "list_modems", serde_json::json!({}), timeout_ms)
        .await
        .map(|r| r.slots)
        .unwrap_or_default()
}

/// Sysfs-only fallback when neither the native nor CLI transport is
/// reachable: `/sys/class/net/<iface>/carrier` tells us up/down, nothing
/// more. RF metrics stay null, which the scorer already treats as maximally
/// bad per section 4.3.
fn read_sysfs_fallback(interface: &str) -> Option<CellularFields> {
    let carrier = std::fs::read_to_string(format!("/sys/class/net/{interface}/carrier")).ok()?;
    if carrier.trim() != "1" {
        return None;
    }
    Some(CellularFields::default())
}
