//! Scoring engine (C3): per-tick instant score, EWMA, windowed average, and
//! the blended final score used for ranking.

use std::collections::HashMap;

use crate::config::{DataCapMode, ScoringConfig};
use crate::model::{Class, ClassFields, Member, Sample};

/// `norm(x, ok, bad)`: 0 at or below `ok`, 1 at or above `bad`, linear
/// between. `ok` may be greater or less than `bad`; both directions are
/// supported even though every current caller has `ok < bad`.
pub fn norm(x: f64, ok: f64, bad: f64) -> f64 {
    if (bad - ok).abs() < 1e-12 {
        return if x >= bad { 1.0 } else { 0.0 };
    }
    let t = (x - ok) / (bad - ok);
    t.clamp(0.0, 1.0)
}

/// Whether a satellite sample's signal should be treated as poor, per the
/// critical SNR interpretation rule (section 4.2): `snr_above_noise=false`
/// ALONE is never sufficient.
pub fn satellite_signal_is_poor(
    snr_persistently_low: Option<bool>,
    snr_above_noise: Option<bool>,
    snr_db: Option<f64>,
) -> bool {
    if snr_persistently_low == Some(true) {
        return true;
    }
    if snr_above_noise == Some(false) {
        if let Some(snr) = snr_db {
            return snr < 3.0;
        }
    }
    false
}

/// Additive penalties and bonuses for one sample, per section 4.3.
/// Penalties are capped in aggregate at 60; bonuses are not separately
/// capped beyond their own per-rule value (max two can ever fire: cellular
/// strong radio and satellite low obstruction are mutually exclusive by
/// class, so no explicit aggregate cap is needed there).
fn penalties_and_bonuses(member: &Member, sample: &Sample, data_cap_mode: DataCapMode) -> (f64, f64) {
    let mut penalty = 0.0;
    let mut bonus = 0.0;

    match &sample.class_fields {
        ClassFields::Cellular(c) => {
            if !member.prefer_roaming && c.roaming == Some(true) {
                penalty += 15.0;
            }
            let weak = c.rsrp_dbm.map(|v| v < -110.0).unwrap_or(false)
                || c.sinr_db.map(|v| v < 0.0).unwrap_or(false);
            if weak {
                penalty += 10.0;
            }
            let strong = c.rsrp_dbm.map(|v| v > -85.0).unwrap_or(false)
                && c.sinr_db.map(|v| v > 15.0).unwrap_or(false);
            if strong {
                bonus += 5.0;
            }
            if c.rsrp_dbm.is_none() {
                // Null RF metrics: treated as bad per "if a metric is null,
                // the corresponding penalty is maximum" (section 4.3).
                penalty += 10.0;
            }
        }
        ClassFields::Wifi(w) => {
            let weak = w.signal_dbm.map(|v| v < -80.0).unwrap_or(true);
            if weak {
                penalty += 10.0;
            }
            // Tethering mode (phone hotspot) is inherently less stable than
            // an infrastructure AP station link, per section 4.2.
            if w.mode.as_deref() == Some("tether") {
                penalty += 10.0;
            }
        }
        ClassFields::Satellite(s) => {
            if s.outage_in_progress == Some(true) {
                penalty += 30.0;
            }
            if satellite_signal_is_poor(s.snr_persistently_low, s.snr_above_noise, s.snr_db) {
                penalty += 10.0;
            }
            if s.thermal_throttle == Some(true) {
                penalty += 10.0;
            }
            if let Some(obstruction) = s.obstruction_pct {
                if obstruction < 0.5 {
                    bonus += 3.0;
                }
            }
        }
        ClassFields::None => {}
    }

    if member.metered && data_cap_mode == DataCapMode::Conservative {
        penalty += 5.0;
    }

    (penalty.min(60.0), bonus)
}

/// Stateful per-member EWMA carry. Seeded from the first valid sample, not
/// from zero, per the data-model invariant.
#[derive(Debug, Default)]
pub struct Scorer {
    ewma_by_member: HashMap<String, f64>,
}

impl Scorer {
    pub fn new() -> Self {
        Scorer::default()
    }

    /// Remove EWMA state for a member Discovery no longer sees, so a later
    /// member reusing the same name doesn't inherit a stale seed.
    pub fn forget(&mut self, member_name: &str) {
        self.ewma_by_member.remove(member_name);
    }

    /// Score `sample` in place for `member`, given the most recent
    /// already-scored `instant` values for the same member within
    /// `history_window_s` (oldest first, NOT including `sample` itself).
    pub fn score(
        &mut self,
        member: &Member,
        sample: &mut Sample,
        cfg: &ScoringConfig,
        data_cap_mode: DataCapMode,
        recent_instants: &[f64],
    ) {
        let base_weight = member.weight as f64;

        let latency_norm = match sample.latency_ms {
            Some(ms) => norm(ms, cfg.latency_ok_ms, cfg.latency_bad_ms),
            None => 1.0,
        };
        let loss_norm = norm(sample.loss_pct, cfg.loss_ok_pct, cfg.loss_bad_pct);
        let jitter_norm = norm(sample.jitter_ms, cfg.jitter_ok_ms, cfg.jitter_bad_ms);
        let obstruction_norm = if member.class == Class::Satellite {
            match &sample.class_fields {
                ClassFields::Satellite(s) => match s.obstruction_pct {
                    Some(pct) => norm(pct, cfg.obstruction_ok_pct, cfg.obstruction_bad_pct),
                    None => 1.0,
                },
                _ => 1.0,
            }
        } else {
            0.0
        };

        let (penalty, bonus) = penalties_and_bonuses(member, sample, data_cap_mode);

        let instant = (base_weight
            - cfg.weight_latency * latency_norm * 100.0
            - cfg.weight_loss * loss_norm * 100.0
            - cfg.weight_jitter * jitter_norm * 100.0
            - cfg.weight_obstruction * obstruction_norm * 100.0
            - penalty
            + bonus)
            .clamp(0.0, 100.0);

        let prev_ewma = self.ewma_by_member.get(&member.name).copied();
        let ewma = match prev_ewma {
            Some(prev) => 0.2 * instant + 0.8 * prev,
            None => instant,
        };
        self.ewma_by_member.insert(member.name.clone(), ewma);

        let window_avg = if recent_instants.is_empty() {
            instant
        } else {
            (recent_instants.iter().sum::<f64>() + instant) / (recent_instants.len() as f64 + 1.0)
        };

        let r#final = 0.30 * instant + 0.50 * ewma + 0.20 * window_avg;

        sample.instant = instant;
        sample.ewma = ewma;
        sample.window_avg = window_avg;
        sample.r#final = r#final.clamp(0.0, 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CellularFields, SatelliteFields, WifiFields};

    fn member(class: Class) -> Member {
        let mut m = Member::new("test", class, "eth9");
        m.weight = 80;
        m
    }

    fn healthy_sample() -> Sample {
        Sample {
            timestamp_ms: 0,
            latency_ms: Some(20.0),
            loss_pct: 0.0,
            jitter_ms: 1.0,
            class_fields: ClassFields::None,
            instant: 0.0,
            ewma: 0.0,
            window_avg: 0.0,
            r#final: 0.0,
            stale: false,
        }
    }

    // ─── norm() ──────────────────────────────────────────────────────────

    #[test]
    fn norm_clamps_outside_range() {
        assert_eq!(norm(-5.0, 0.0, 10.0), 0.0);
        assert_eq!(norm(15.0, 0.0, 10.0), 1.0);
        assert!((norm(5.0, 0.0, 10.0) - 0.5).abs() < 1e-9);
    }

    // ─── SNR rule ────────────────────────────────────────────────────────

    #[test]
    fn snr_false_positive_is_not_poor_signal() {
        // snr_above_noise=false but numeric SNR >= 3dB and not persistently low.
        assert!(!satellite_signal_is_poor(Some(false), Some(false), Some(5.0)));
    }

    #[test]
    fn snr_persistently_low_is_always_poor() {
        assert!(satellite_signal_is_poor(Some(true), Some(true), Some(20.0)));
    }

    #[test]
    fn snr_above_noise_false_with_low_numeric_is_poor() {
        assert!(satellite_signal_is_poor(Some(false), Some(false), Some(1.0)));
    }

    // ─── Score composition ───────────────────────────────────────────────

    #[test]
    fn instant_stays_in_0_100() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut sample = Sample {
            latency_ms: Some(5000.0),
            loss_pct: 100.0,
            jitter_ms: 1000.0,
            ..healthy_sample()
        };
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[]);
        assert!(sample.instant >= 0.0 && sample.instant <= 100.0);
    }

    #[test]
    fn healthy_sample_scores_near_base_weight() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut sample = healthy_sample();
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[]);
        assert!(
            sample.instant > 70.0,
            "expected near base_weight=80, got {}",
            sample.instant
        );
    }

    #[test]
    fn ewma_seeds_from_first_sample_not_zero() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut sample = healthy_sample();
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[]);
        assert!((sample.ewma - sample.instant).abs() < 1e-9);
    }

    #[test]
    fn ewma_follows_configured_alpha() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();

        let mut s1 = healthy_sample();
        scorer.score(&m, &mut s1, &cfg, DataCapMode::Balanced, &[]);
        let first_instant = s1.instant;

        let mut s2 = Sample {
            latency_ms: Some(2000.0), // much worse
            loss_pct: 50.0,
            jitter_ms: 300.0,
            ..healthy_sample()
        };
        scorer.score(&m, &mut s2, &cfg, DataCapMode::Balanced, &[]);
        let expected = 0.2 * s2.instant + 0.8 * first_instant;
        assert!((s2.ewma - expected).abs() < 1e-6);
    }

    #[test]
    fn null_latency_is_treated_as_maximally_bad() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut sample = Sample {
            latency_ms: None,
            ..healthy_sample()
        };
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[]);

        let mut scorer2 = Scorer::new();
        let mut good = healthy_sample();
        scorer2.score(&m, &mut good, &cfg, DataCapMode::Balanced, &[]);

        assert!(sample.instant < good.instant);
    }

    // ─── Penalties / bonuses ─────────────────────────────────────────────

    #[test]
    fn cellular_roaming_penalty_applies_when_not_preferred() {
        let mut scorer = Scorer::new();
        let mut m = member(Class::Cellular);
        m.prefer_roaming = false;
        let cfg = ScoringConfig::default();

        let mut roaming = Sample {
            class_fields: ClassFields::Cellular(CellularFields {
                rsrp_dbm: Some(-80.0),
                rsrq_db: Some(-8.0),
                sinr_db: Some(20.0),
                roaming: Some(true),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer.score(&m, &mut roaming, &cfg, DataCapMode::Balanced, &[]);

        let mut scorer2 = Scorer::new();
        let mut not_roaming = Sample {
            class_fields: ClassFields::Cellular(CellularFields {
                rsrp_dbm: Some(-80.0),
                rsrq_db: Some(-8.0),
                sinr_db: Some(20.0),
                roaming: Some(false),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer2.score(&m, &mut not_roaming, &cfg, DataCapMode::Balanced, &[]);

        assert!(roaming.instant < not_roaming.instant - 10.0);
    }

    #[test]
    fn satellite_outage_penalty_dominates() {
        let mut scorer = Scorer::new();
        let m = member(Class::Satellite);
        let cfg = ScoringConfig::default();
        let mut sample = Sample {
            class_fields: ClassFields::Satellite(SatelliteFields {
                obstruction_pct: Some(1.0),
                snr_db: Some(10.0),
                snr_above_noise: Some(true),
                snr_persistently_low: Some(false),
                outage_in_progress: Some(true),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[]);
        assert!(sample.instant < 60.0, "outage penalty should dominate, got {}", sample.instant);
    }

    #[test]
    fn wifi_weak_signal_penalized() {
        let mut scorer = Scorer::new();
        let m = member(Class::Wifi);
        let cfg = ScoringConfig::default();
        let mut weak = Sample {
            class_fields: ClassFields::Wifi(WifiFields {
                signal_dbm: Some(-90.0),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer.score(&m, &mut weak, &cfg, DataCapMode::Balanced, &[]);

        let mut scorer2 = Scorer::new();
        let mut strong = Sample {
            class_fields: ClassFields::Wifi(WifiFields {
                signal_dbm: Some(-50.0),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer2.score(&m, &mut strong, &cfg, DataCapMode::Balanced, &[]);

        assert!(weak.instant < strong.instant);
    }

    #[test]
    fn wifi_tether_mode_penalized() {
        let mut scorer = Scorer::new();
        let m = member(Class::Wifi);
        let cfg = ScoringConfig::default();
        let mut tethered = Sample {
            class_fields: ClassFields::Wifi(WifiFields {
                signal_dbm: Some(-50.0),
                mode: Some("tether".to_string()),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer.score(&m, &mut tethered, &cfg, DataCapMode::Balanced, &[]);

        let mut scorer2 = Scorer::new();
        let mut station = Sample {
            class_fields: ClassFields::Wifi(WifiFields {
                signal_dbm: Some(-50.0),
                mode: Some("station".to_string()),
                ..Default::default()
            }),
            ..healthy_sample()
        };
        scorer2.score(&m, &mut station, &cfg, DataCapMode::Balanced, &[]);

        assert!(tethered.instant < station.instant);
    }

    #[test]
    fn metered_conservative_penalty_applies() {
        let mut scorer = Scorer::new();
        let mut m = member(Class::Cellular);
        m.metered = true;
        let cfg = ScoringConfig::default();
        let mut sample = healthy_sample();
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Conservative, &[]);

        let mut scorer2 = Scorer::new();
        let mut sample2 = healthy_sample();
        scorer2.score(&m, &mut sample2, &cfg, DataCapMode::Balanced, &[]);

        assert!(sample.instant < sample2.instant);
    }

    #[test]
    fn window_avg_blends_recent_history() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut sample = healthy_sample();
        scorer.score(&m, &mut sample, &cfg, DataCapMode::Balanced, &[90.0, 95.0]);
        let expected = (90.0 + 95.0 + sample.instant) / 3.0;
        assert!((sample.window_avg - expected).abs() < 1e-6);
    }

    #[test]
    fn forget_resets_ewma_seed() {
        let mut scorer = Scorer::new();
        let m = member(Class::Lan);
        let cfg = ScoringConfig::default();
        let mut s1 = healthy_sample();
        scorer.score(&m, &mut s1, &cfg, DataCapMode::Balanced, &[]);

        scorer.forget(&m.name);

        let mut s2 = Sample {
            latency_ms: Some(2000.0),
            loss_pct: 50.0,
            ..healthy_sample()
        };
        scorer.score(&m, &mut s2, &cfg, DataCapMode::Balanced, &[]);
        assert!((s2.ewma - s2.instant).abs() < 1e-9, "ewma should reseed after forget()");
    }
}
