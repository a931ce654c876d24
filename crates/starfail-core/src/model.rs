//! Core data model: members, samples, and events.
//!
//! Cyclic references are deliberately avoided: samples and events refer to
//! members by stable `name` (String), never by pointer or index, so the
//! telemetry store never holds anything back into the member table.

use serde::{Deserialize, Serialize};

/// The kind of uplink a member represents.
///
/// Ordering matters: `Ord` reflects the tiebreak class preference from the
/// decision engine (satellite > cellular > wifi > lan > other), so ranking
/// code can just compare `Class` values directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Class {
    Satellite,
    Cellular,
    Wifi,
    Lan,
    Other,
}

impl Class {
    pub fn as_str(&self) -> &'static str {
        match self {
            Class::Satellite => "satellite",
            Class::Cellular => "cellular",
            Class::Wifi => "wifi",
            Class::Lan => "lan",
            Class::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Class> {
        match s.to_ascii_lowercase().as_str() {
            "satellite" => Some(Class::Satellite),
            "cellular" => Some(Class::Cellular),
            "wifi" | "wi-fi" => Some(Class::Wifi),
            "lan" => Some(Class::Lan),
            "other" => Some(Class::Other),
            _ => None,
        }
    }
}

/// How a member was put into service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectMode {
    #[default]
    Auto,
    Disabled,
    Forced,
}

impl DetectMode {
    pub fn parse(s: &str) -> Option<DetectMode> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(DetectMode::Auto),
            "disabled" => Some(DetectMode::Disabled),
            "forced" => Some(DetectMode::Forced),
            _ => None,
        }
    }
}

/// A monitored uplink known to the routing-policy engine.
///
/// Owned exclusively by Discovery (C6); every other component holds a copy
/// refreshed each tick rather than a live reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub class: Class,
    pub interface: String,
    /// 0..100 class preference, doubles as the scoring `base_weight`.
    pub weight: u8,
    pub detect: DetectMode,
    pub metered: bool,
    pub prefer_roaming: bool,
    pub min_uptime_s: u64,
    pub cooldown_s: u64,

    // Runtime fields, refreshed by Discovery/Decision each tick.
    pub eligible: bool,
    pub in_warmup: bool,
    pub in_cooldown: bool,
    pub last_change: Option<u64>,
    pub last_seen: u64,
}

impl Member {
    pub fn new(name: impl Into<String>, class: Class, interface: impl Into<String>) -> Self {
        Member {
            name: name.into(),
            class,
            interface: interface.into(),
            weight: 50,
            detect: DetectMode::Auto,
            metered: false,
            prefer_roaming: false,
            min_uptime_s: 30,
            cooldown_s: 60,
            eligible: false,
            in_warmup: true,
            in_cooldown: false,
            last_change: None,
            last_seen: 0,
        }
    }
}

/// Satellite-specific fields of a [`Sample`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SatelliteFields {
    pub obstruction_pct: Option<f64>,
    pub snr_db: Option<f64>,
    pub snr_above_noise: Option<bool>,
    pub snr_persistently_low: Option<bool>,
    pub pop_ping_latency_ms: Option<f64>,
    pub outage_in_progress: Option<bool>,
    pub reboot_ready: Option<bool>,
    pub thermal_throttle: Option<bool>,
}

/// Cellular-specific fields of a [`Sample`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellularFields {
    pub rsrp_dbm: Option<f64>,
    pub rsrq_db: Option<f64>,
    pub sinr_db: Option<f64>,
    pub network_type: Option<String>,
    pub roaming: Option<bool>,
    pub operator: Option<String>,
    pub band: Option<String>,
    pub cell_id: Option<String>,
}

/// Wi-Fi-specific fields of a [`Sample`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiFields {
    pub signal_dbm: Option<f64>,
    pub noise_dbm: Option<f64>,
    pub snr_db: Option<f64>,
    pub bitrate_mbps: Option<f64>,
    pub mode: Option<String>,
}

/// Per-class telemetry payload. A concrete enum with a variant tag, per the
/// "avoid polymorphism over collectors" design note — the decision engine
/// and scorer only ever touch the common fields on [`Sample`] directly and
/// match on this enum for the handful of class-specific rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClassFields {
    Satellite(SatelliteFields),
    Cellular(CellularFields),
    Wifi(WifiFields),
    None,
}

/// One metric snapshot for one member at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub latency_ms: Option<f64>,
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub class_fields: ClassFields,

    // Populated by Scoring (C3); absent (0.0) until the first scoring pass.
    pub instant: f64,
    pub ewma: f64,
    pub window_avg: f64,
    pub r#final: f64,

    /// Set when a tick-wide barrier timeout forced reuse of the previous
    /// sample for this member (section 5: slow collectors are abandoned).
    pub stale: bool,
}

impl Sample {
    /// A sample representing total collector failure: every metric-sensitive
    /// field is null so the scorer treats the link as maximally degraded.
    pub fn unreachable(timestamp_ms: u64) -> Self {
        Sample {
            timestamp_ms,
            latency_ms: None,
            loss_pct: 100.0,
            jitter_ms: 0.0,
            class_fields: ClassFields::None,
            instant: 0.0,
            ewma: 0.0,
            window_avg: 0.0,
            r#final: 0.0,
            stale: false,
        }
    }
}

/// The kind of lifecycle/decision event recorded in the event ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Discovery,
    Switch,
    Restore,
    Demote,
    ProviderError,
    Throttle,
    WarmupDone,
    CooldownStart,
    CooldownEnd,
    ConfigReload,
    MemoryPressure,
}

/// A record of a decision or lifecycle state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: uuid::Uuid,
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub from: Option<String>,
    pub to: Option<String>,
    pub reason: String,
    /// Free-form quantitative context: score deltas, window lengths,
    /// triggering metric values. Kept as JSON so every event kind can attach
    /// whatever context is relevant without a per-kind struct explosion.
    pub context: serde_json::Value,
    pub duration_ms: Option<u64>,
}

impl Event {
    pub fn new(timestamp_ms: u64, kind: EventKind, reason: impl Into<String>) -> Self {
        Event {
            id: uuid::Uuid::now_v7(),
            timestamp_ms,
            kind,
            from: None,
            to: None,
            reason: reason.into(),
            context: serde_json::Value::Null,
            duration_ms: None,
        }
    }

    pub fn with_from_to(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Class ordering/parsing ─────────────────────────────────────────

    #[test]
    fn class_preference_order() {
        assert!(Class::Satellite < Class::Cellular);
        assert!(Class::Cellular < Class::Wifi);
        assert!(Class::Wifi < Class::Lan);
        assert!(Class::Lan < Class::Other);
    }

    #[test]
    fn class_parse_case_insensitive() {
        assert_eq!(Class::parse("SATELLITE"), Some(Class::Satellite));
        assert_eq!(Class::parse("wifi"), Some(Class::Wifi));
        assert_eq!(Class::parse("bogus"), None);
    }

    // ─── Sample ──────────────────────────────────────────────────────────

    #[test]
    fn unreachable_sample_has_null_sensitive_fields() {
        let s = Sample::unreachable(1000);
        assert!(s.latency_ms.is_none());
        assert!((s.loss_pct - 100.0).abs() < 1e-9);
        assert!(matches!(s.class_fields, ClassFields::None));
    }

    // ─── Event ───────────────────────────────────────────────────────────

    #[test]
    fn event_builder_sets_from_to_and_context() {
        let e = Event::new(5000, EventKind::Switch, "predictive_trigger")
            .with_from_to(Some("starlink".into()), Some("cell0".into()))
            .with_context(serde_json::json!({"score_delta": 14.2}));
        assert_eq!(e.from.as_deref(), Some("starlink"));
        assert_eq!(e.to.as_deref(), Some("cell0"));
        assert_eq!(e.context["score_delta"], 14.2);
    }
}
