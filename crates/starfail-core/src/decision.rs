//! Decision engine (C4): hysteresis timers, ranking, predictive triggers,
//! and the switch/restore call into the controller.
//!
//! Runtime eligibility fields (`eligible`, `in_warmup`, `in_cooldown`,
//! `last_change`) on [`Member`] are owned here — this is the only place that
//! writes them; every other component (scoring, the RPC layer) only reads
//! what Discovery/Decision last wrote.

use std::collections::HashMap;

use crate::config::MainConfig;
use crate::model::{Class, ClassFields, DetectMode, Event, EventKind, Member, Sample};
use crate::stats::{acceleration, slope};
use crate::telemetry::TelemetryStore;

#[derive(Debug, Default, Clone)]
struct MemberRuntime {
    bad_since: Option<u64>,
    good_since: Option<u64>,
    up_since: Option<u64>,
    was_in_cooldown: bool,
}

/// The outcome of one `evaluate()` call that changes the primary. `None`
/// means no change this tick (including the idempotent "candidate is
/// already primary" case, which produces no event either).
///
/// A `Decision` is *pending* until the caller actually drives the controller
/// and reports back via [`DecisionEngine::confirm_switch`] or
/// [`DecisionEngine::revert_switch`] — `evaluate` itself never commits
/// `current_primary` or the departing member's cooldown, since the switch it
/// names may still fail at the controller (section 7: `ControllerConflict`
/// must leave the routing table, and this engine's belief about it, exactly
/// where it was).
pub struct Decision {
    pub from: Option<String>,
    pub to: String,
    pub kind: EventKind,
    pub reason: &'static str,
    departing_cooldown_s: u64,
}

pub struct DecisionEngine {
    runtime: HashMap<String, MemberRuntime>,
    member_cooldown_until_ms: HashMap<String, u64>,
    pub current_primary: Option<String>,
    last_switch_at_ms: Option<u64>,
    last_predictive_at_ms: Option<u64>,
}

impl DecisionEngine {
    pub fn new() -> Self {
        DecisionEngine {
            runtime: HashMap::new(),
            member_cooldown_until_ms: HashMap::new(),
            current_primary: None,
            last_switch_at_ms: None,
            last_predictive_at_ms: None,
        }
    }

    /// Discovery lost this member: drop its hysteresis state so a later
    /// member reusing the name starts cold, and clear it from primary if it
    /// was serving.
    pub fn forget(&mut self, name: &str) {
        self.runtime.remove(name);
        self.member_cooldown_until_ms.remove(name);
        if self.current_primary.as_deref() == Some(name) {
            self.current_primary = None;
        }
    }

    /// Run one tick: update every member's hysteresis timers and runtime
    /// eligibility flags in place, rank eligible members, and decide whether
    /// to switch or restore. Returns the decision (if any) for the
    /// controller plus every lifecycle event raised along the way.
    pub fn evaluate(
        &mut self,
        now_ms: u64,
        members: &mut [Member],
        latest: &HashMap<String, Sample>,
        store: &TelemetryStore,
        cfg: &MainConfig,
    ) -> (Option<Decision>, Vec<Event>) {
        let mut events = Vec::new();

        for m in members.iter_mut() {
            let rt = self.runtime.entry(m.name.clone()).or_default();
            let sample = latest.get(&m.name);

            let is_bad = match sample {
                Some(s) => {
                    s.loss_pct >= cfg.fail_threshold_loss
                        || s.latency_ms.map(|l| l >= cfg.fail_threshold_latency).unwrap_or(true)
                }
                None => true,
            };
            rt.bad_since = if is_bad { Some(rt.bad_since.unwrap_or(now_ms)) } else { None };

            let is_good = match sample {
                Some(s) => {
                    s.loss_pct <= cfg.restore_threshold_loss
                        && s.latency_ms.map(|l| l <= cfg.restore_threshold_latency).unwrap_or(false)
                }
                None => false,
            };
            rt.good_since = if is_good { Some(rt.good_since.unwrap_or(now_ms)) } else { None };

            let reachable = sample.map(|s| s.latency_ms.is_some() || s.loss_pct < 100.0).unwrap_or(false);
            rt.up_since = if reachable { Some(rt.up_since.unwrap_or(now_ms)) } else { None };
            let warmup_elapsed = rt
                .up_since
                .map(|t| now_ms.saturating_sub(t) >= m.min_uptime_s * 1000)
                .unwrap_or(false);
            let was_warmup = m.in_warmup;
            m.in_warmup = !warmup_elapsed;
            if was_warmup && !m.in_warmup {
                events.push(
                    Event::new(now_ms, EventKind::WarmupDone, "min_uptime_elapsed")
                        .with_from_to(None, Some(m.name.clone())),
                );
            }

            let cooldown_until = self.member_cooldown_until_ms.get(&m.name).copied().unwrap_or(0);
            m.in_cooldown = now_ms < cooldown_until;
            if !rt.was_in_cooldown && m.in_cooldown {
                events.push(
                    Event::new(now_ms, EventKind::CooldownStart, "demoted_after_switch")
                        .with_from_to(None, Some(m.name.clone())),
                );
            } else if rt.was_in_cooldown && !m.in_cooldown {
                events.push(
                    Event::new(now_ms, EventKind::CooldownEnd, "cooldown_elapsed")
                        .with_from_to(None, Some(m.name.clone())),
                );
            }
            rt.was_in_cooldown = m.in_cooldown;

            let hard_error = sample.map(|s| s.latency_ms.is_none() && s.loss_pct >= 100.0).unwrap_or(true);
            m.eligible = m.detect != DetectMode::Disabled && !m.in_warmup && !m.in_cooldown && !hard_error;
        }

        let mut ranked: Vec<&Member> = members.iter().filter(|m| m.eligible).collect();
        ranked.sort_by(|a, b| {
            let fa = latest.get(&a.name).map(|s| s.r#final).unwrap_or(0.0);
            let fb = latest.get(&b.name).map(|s| s.r#final).unwrap_or(0.0);
            fb.partial_cmp(&fa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.weight.cmp(&a.weight))
                .then(a.class.cmp(&b.class))
                .then(a.name.cmp(&b.name))
        });

        if ranked.is_empty() {
            events.push(Event::new(now_ms, EventKind::Demote, "no_eligible_members"));
            return (None, events);
        }

        let candidate_name = ranked[0].name.clone();
        let candidate_class = ranked[0].class;

        let Some(current_name) = self.current_primary.clone() else {
            events.push(
                Event::new(now_ms, EventKind::Switch, "initial_selection")
                    .with_from_to(None, Some(candidate_name.clone())),
            );
            return (
                Some(Decision {
                    from: None,
                    to: candidate_name,
                    kind: EventKind::Switch,
                    reason: "initial_selection",
                    departing_cooldown_s: 0,
                }),
                events,
            );
        };

        if candidate_name == current_name {
            return (None, events);
        }

        let current_final = latest.get(&current_name).map(|s| s.r#final).unwrap_or(0.0);
        let candidate_final = latest.get(&candidate_name).map(|s| s.r#final).unwrap_or(0.0);
        let margin_ok = candidate_final - current_final >= cfg.switch_margin;

        let current_class = members
            .iter()
            .find(|m| m.name == current_name)
            .map(|m| m.class)
            .unwrap_or(Class::Other);

        let fail_gate = self
            .runtime
            .get(&current_name)
            .and_then(|rt| rt.bad_since)
            .map(|t| now_ms.saturating_sub(t) >= cfg.fail_min_duration_s * 1000)
            .unwrap_or(false);
        let predictive_gate =
            cfg.predictive && self.predictive_trigger_fires(&current_name, now_ms, store, cfg, &mut events);
        let restore_gate = candidate_class < current_class
            && self
                .runtime
                .get(&candidate_name)
                .and_then(|rt| rt.good_since)
                .map(|t| now_ms.saturating_sub(t) >= cfg.restore_min_duration_s * 1000)
                .unwrap_or(false);

        let global_cooldown_ok = self
            .last_switch_at_ms
            .map(|t| now_ms.saturating_sub(t) >= cfg.cooldown_s * 1000)
            .unwrap_or(true);

        if margin_ok && (fail_gate || predictive_gate || restore_gate) && global_cooldown_ok {
            let departing_cooldown_s = members
                .iter()
                .find(|m| m.name == current_name)
                .map(|m| m.cooldown_s)
                .unwrap_or(cfg.cooldown_s);

            let is_restore = candidate_class < current_class && !fail_gate && !predictive_gate;
            let kind = if is_restore { EventKind::Restore } else { EventKind::Switch };
            let reason = if predictive_gate {
                "predictive_trigger"
            } else if fail_gate {
                "sustained_bad"
            } else {
                "sustained_good"
            };

            let ev = Event::new(now_ms, kind, reason)
                .with_from_to(Some(current_name.clone()), Some(candidate_name.clone()))
                .with_context(serde_json::json!({
                    "current_final": current_final,
                    "candidate_final": candidate_final,
                    "score_delta": candidate_final - current_final,
                }));
            events.push(ev);

            return (
                Some(Decision {
                    from: Some(current_name),
                    to: candidate_name,
                    kind,
                    reason,
                    departing_cooldown_s,
                }),
                events,
            );
        }

        (None, events)
    }

    /// The controller successfully made `decision.to` the effective primary:
    /// commit the belief this engine holds about `current_primary`, start
    /// the departing member's cooldown, and record the switch for the
    /// global-cooldown gate. Call this only after `Controller::switch`
    /// returns `Ok(())`.
    pub fn confirm_switch(&mut self, decision: &Decision, now_ms: u64) {
        if let Some(from) = &decision.from {
            self.member_cooldown_until_ms
                .insert(from.clone(), now_ms + decision.departing_cooldown_s * 1000);
        }
        self.last_switch_at_ms = Some(now_ms);
        self.current_primary = Some(decision.to.clone());
    }

    /// The controller failed to make `decision.to` effective (e.g. a
    /// `ControllerConflict` that rolled back). `evaluate` never mutated
    /// `current_primary` or the departing member's cooldown for this
    /// decision, so there is nothing to undo here; the engine simply keeps
    /// believing whatever it believed before the attempt and will retry
    /// next tick if the same conditions still hold.
    pub fn revert_switch(&mut self, _decision: &Decision, _now_ms: u64) {}

    /// Section 4.4 predictive triggers, rate-limited to at most once per
    /// `5 * fail_min_duration_s`. A trigger that fires while rate-limited is
    /// logged as a throttle event rather than silently dropped.
    fn predictive_trigger_fires(
        &mut self,
        primary: &str,
        now_ms: u64,
        store: &TelemetryStore,
        cfg: &MainConfig,
        events: &mut Vec<Event>,
    ) -> bool {
        let window: Vec<Sample> = store
            .last_n_samples(primary, 128)
            .into_iter()
            .filter(|s| now_ms.saturating_sub(s.timestamp_ms) <= 60_000)
            .collect();
        if window.len() < 3 {
            return false;
        }

        let dt_s = {
            let span_ms = window.last().unwrap().timestamp_ms.saturating_sub(window.first().unwrap().timestamp_ms);
            let raw = span_ms as f64 / 1000.0 / (window.len() - 1) as f64;
            if raw <= 0.0 { 1.5 } else { raw }
        };

        let loss_series: Vec<f64> = window.iter().map(|s| s.loss_pct).collect();
        let latency_series: Vec<f64> = window
            .iter()
            .map(|s| s.latency_ms.unwrap_or(cfg.fail_threshold_latency))
            .collect();

        let loss_slope_per_s = slope(&loss_series) / dt_s;
        let latency_slope_per_s = slope(&latency_series) / dt_s;

        let mut reason = "";
        if loss_slope_per_s > 1.0 {
            reason = "loss_slope";
        } else if latency_slope_per_s > 50.0 {
            reason = "latency_slope";
        } else if let Some(jitter_reason) = self.jitter_spike(primary, now_ms, store, &window) {
            reason = jitter_reason;
        } else if let Some(satellite_reason) = satellite_predictive_reason(&window) {
            reason = satellite_reason;
        }

        if reason.is_empty() {
            return false;
        }

        let rate_limit_ms = 5 * cfg.fail_min_duration_s * 1000;
        let throttled = self
            .last_predictive_at_ms
            .map(|t| now_ms.saturating_sub(t) < rate_limit_ms)
            .unwrap_or(false);
        if throttled {
            events.push(
                Event::new(now_ms, EventKind::Throttle, "predictive_trigger_rate_limited")
                    .with_context(serde_json::json!({"trigger": reason})),
            );
            return false;
        }

        self.last_predictive_at_ms = Some(now_ms);
        true
    }

    fn jitter_spike(
        &self,
        primary: &str,
        now_ms: u64,
        store: &TelemetryStore,
        window_60s: &[Sample],
    ) -> Option<&'static str> {
        let baseline_window: Vec<Sample> = store
            .last_n_samples(primary, 512)
            .into_iter()
            .filter(|s| now_ms.saturating_sub(s.timestamp_ms) <= 300_000)
            .collect();
        if baseline_window.len() < 4 {
            return None;
        }
        let baseline_jitter = baseline_window.iter().map(|s| s.jitter_ms).sum::<f64>() / baseline_window.len() as f64;
        if baseline_jitter <= 0.0 {
            return None;
        }

        let recent_5s: Vec<&Sample> = window_60s
            .iter()
            .filter(|s| now_ms.saturating_sub(s.timestamp_ms) <= 5_000)
            .collect();
        if recent_5s.len() >= 2 && recent_5s.iter().all(|s| s.jitter_ms > 3.0 * baseline_jitter) {
            return Some("jitter_spike");
        }
        None
    }
}

fn satellite_predictive_reason(window_60s: &[Sample]) -> Option<&'static str> {
    let last = window_60s.last()?;
    let ClassFields::Satellite(last_fields) = &last.class_fields else {
        return None;
    };

    let obstruction_series: Vec<f64> = window_60s
        .iter()
        .filter_map(|s| match &s.class_fields {
            ClassFields::Satellite(f) => f.obstruction_pct,
            _ => None,
        })
        .collect();
    if obstruction_series.len() >= 3 {
        let rising_above_2pct =
            obstruction_series.last().copied().unwrap_or(0.0) > 2.0 && obstruction_series.first().copied().unwrap_or(0.0) <= 2.0;
        if acceleration(&obstruction_series) > 0.0 && rising_above_2pct {
            return Some("obstruction_acceleration");
        }
    }

    if last_fields.outage_in_progress == Some(true) || last_fields.reboot_ready == Some(true) {
        return Some("satellite_outage_or_reboot");
    }
    None
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassFields, DetectMode};

    fn sample(loss: f64, latency: Option<f64>, final_score: f64) -> Sample {
        Sample {
            timestamp_ms: 0,
            latency_ms: latency,
            loss_pct: loss,
            jitter_ms: 0.0,
            class_fields: ClassFields::None,
            instant: final_score,
            ewma: final_score,
            window_avg: final_score,
            r#final: final_score,
            stale: false,
        }
    }

    fn member(name: &str, class: Class) -> Member {
        let mut m = Member::new(name, class, name);
        m.min_uptime_s = 0;
        m
    }

    fn cfg() -> MainConfig {
        MainConfig::default()
    }

    // ─── eligibility ─────────────────────────────────────────────────────

    #[test]
    fn disabled_member_is_never_eligible() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut m = member("wan0", Class::Lan);
        m.detect = DetectMode::Disabled;
        let mut members = vec![m];
        let latest = HashMap::from([("wan0".to_string(), sample(0.0, Some(10.0), 90.0))]);
        let (decision, _events) = engine.evaluate(1_000, &mut members, &latest, &store, &cfg());
        assert!(decision.is_none());
        assert!(!members[0].eligible);
    }

    #[test]
    fn initial_selection_picks_best_and_emits_switch() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Lan), member("wan1", Class::Wifi)];
        let latest = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 90.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 50.0)),
        ]);
        let (decision, events) = engine.evaluate(1_000, &mut members, &latest, &store, &cfg());
        let d = decision.unwrap();
        assert_eq!(d.to, "wan0");
        assert_eq!(d.from, None);
        assert_eq!(events[0].reason, "initial_selection");
        assert!(engine.current_primary.is_none(), "evaluate must not commit before confirm_switch");
        engine.confirm_switch(&d, 1_000);
        assert_eq!(engine.current_primary.as_deref(), Some("wan0"));
    }

    #[test]
    fn candidate_matching_current_primary_is_a_pure_noop() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Lan)];
        let latest = HashMap::from([("wan0".to_string(), sample(0.0, Some(10.0), 90.0))]);
        let (first, _) = engine.evaluate(1_000, &mut members, &latest, &store, &cfg());
        engine.confirm_switch(&first.unwrap(), 1_000);
        let (decision, events) = engine.evaluate(2_000, &mut members, &latest, &store, &cfg());
        assert!(decision.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn zero_eligible_members_leaves_primary_untouched_and_demotes() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut m = member("wan0", Class::Lan);
        m.detect = DetectMode::Disabled;
        let mut members = vec![m];
        let (decision, events) = engine.evaluate(1_000, &mut members, &HashMap::new(), &store, &cfg());
        assert!(decision.is_none());
        assert_eq!(events[0].reason, "no_eligible_members");
    }

    #[test]
    fn switch_requires_margin_even_with_sustained_bad_primary() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Lan), member("wan1", Class::Wifi)];

        // Establish wan0 as primary first, while it's still comfortably ahead.
        let healthy = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 90.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 50.0)),
        ]);
        let (first, _) = engine.evaluate(0, &mut members, &healthy, &store, &cfg());
        engine.confirm_switch(&first.unwrap(), 0);

        let bad = HashMap::from([
            ("wan0".to_string(), sample(10.0, Some(800.0), 40.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 45.0)),
        ]);
        engine.evaluate(1_000, &mut members, &bad, &store, &cfg());
        let mut c = cfg();
        c.fail_min_duration_s = 0;
        c.cooldown_s = 0;
        let (decision, _) = engine.evaluate(2_000, &mut members, &bad, &store, &c);
        assert!(decision.is_none(), "5pt margin below switch_margin=10 must not switch");
    }

    #[test]
    fn sustained_bad_primary_with_margin_switches() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Lan), member("wan1", Class::Wifi)];

        let healthy = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 90.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 50.0)),
        ]);
        let mut c = cfg();
        c.fail_min_duration_s = 5;
        c.cooldown_s = 0;
        let (first, _) = engine.evaluate(0, &mut members, &healthy, &store, &c);
        engine.confirm_switch(&first.unwrap(), 0);

        let bad = HashMap::from([
            ("wan0".to_string(), sample(10.0, Some(800.0), 20.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 90.0)),
        ]);
        engine.evaluate(1_000, &mut members, &bad, &store, &c);
        let (decision, events) = engine.evaluate(10_000, &mut members, &bad, &store, &c);
        let d = decision.unwrap();
        assert_eq!(d.to, "wan1");
        assert_eq!(d.kind, EventKind::Switch);
        assert!(events.iter().any(|e| e.reason == "sustained_bad"));
    }

    #[test]
    fn healthy_primary_is_not_switched_to_a_same_class_candidate_via_restore_gate() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Lan), member("wan1", Class::Lan)];

        // wan0 starts out ahead so it becomes primary first.
        let initial = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 90.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 50.0)),
        ]);
        let mut c = cfg();
        c.restore_min_duration_s = 0;
        c.cooldown_s = 0;
        let (first, _) = engine.evaluate(0, &mut members, &initial, &store, &c);
        engine.confirm_switch(&first.unwrap(), 0);
        assert_eq!(engine.current_primary.as_deref(), Some("wan0"));

        // wan1 now scores well above switch_margin, but it's the same class
        // (Lan), so the restore_gate — which requires a strictly
        // higher-preference candidate class — must not fire.
        let good = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 50.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 70.0)),
        ]);
        engine.evaluate(1_000, &mut members, &good, &store, &c);
        let (decision, _events) = engine.evaluate(2_000, &mut members, &good, &store, &c);
        assert!(
            decision.is_none(),
            "restore_gate must require a strictly higher-preference candidate class, \
             not just margin plus a good_since timer"
        );
    }

    #[test]
    fn failed_controller_switch_leaves_decision_state_unchanged() {
        let mut engine = DecisionEngine::new();
        let store = TelemetryStore::new(100, 100, 16, 24);
        let mut members = vec![member("wan0", Class::Satellite), member("wan1", Class::Cellular)];

        let healthy = HashMap::from([
            ("wan0".to_string(), sample(0.0, Some(10.0), 90.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 50.0)),
        ]);
        let (first, _) = engine.evaluate(0, &mut members, &healthy, &store, &cfg());
        engine.confirm_switch(&first.unwrap(), 0);
        assert_eq!(engine.current_primary.as_deref(), Some("wan0"));

        let degraded = HashMap::from([
            ("wan0".to_string(), sample(10.0, Some(800.0), 20.0)),
            ("wan1".to_string(), sample(0.0, Some(10.0), 90.0)),
        ]);
        let mut c = cfg();
        c.fail_min_duration_s = 5;
        c.cooldown_s = 0;
        engine.evaluate(1_000, &mut members, &degraded, &store, &c);
        let (decision, _) = engine.evaluate(10_000, &mut members, &degraded, &store, &c);
        let d = decision.unwrap();
        assert_eq!(d.to, "wan1");

        // Simulate a controller failure (e.g. ControllerConflict): the
        // pending decision is reverted rather than confirmed.
        engine.revert_switch(&d, 10_000);
        assert_eq!(
            engine.current_primary.as_deref(),
            Some("wan0"),
            "a failed controller switch must not change who this engine believes is primary"
        );

        // The next tick re-evaluates the same still-degraded conditions and
        // proposes the same switch again rather than getting stuck.
        let (retry, _) = engine.evaluate(11_000, &mut members, &degraded, &store, &c);
        assert_eq!(retry.unwrap().to, "wan1");
    }
}
