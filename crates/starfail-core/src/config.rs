//! Host config store parsing: a hand-rolled tokenizer for the UCI-style
//! section-and-option text format, plus the `Input -> resolve() -> Config`
//! typed-defaulting idiom used throughout this codebase's configuration
//! layer.
//!
//! The grammar has no existing crate in this dependency tree (unlike TOML),
//! so [`parse_raw`] tokenizes it directly: line-oriented, `#`-comments,
//! `config <type> ['name']` section headers, `option key 'value'` and
//! `list key 'value'` body lines. Every `*Input` struct below then mirrors
//! the section's options as `Option<T>` fields; `.resolve()` applies the
//! documented default/clamp/WARN-on-invalid rules and produces a plain
//! `*Config` struct with no further optionality.

use std::collections::HashMap;

use crate::model::{Class, DetectMode};

// ─── Raw tokenizer ───────────────────────────────────────────────────────

/// One `config <type> 'name'` block with its `option`/`list` body lines.
#[derive(Debug, Clone, Default)]
pub struct RawSection {
    pub section_type: String,
    pub name: Option<String>,
    pub options: HashMap<String, String>,
    pub lists: HashMap<String, Vec<String>>,
}

/// Tokenize the host config store's text format into raw sections.
///
/// Unknown directives and malformed lines are skipped rather than treated as
/// fatal — the store is owned by an external collaborator (section 1, "out
/// of scope") and may contain sections this core has no opinion about.
pub fn parse_raw(text: &str) -> Vec<RawSection> {
    let mut sections = Vec::new();
    let mut current: Option<RawSection> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("config ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let section_type = parts.next().unwrap_or_default().to_string();
            let name = parts.next().map(|s| unquote(s.trim()));
            current = Some(RawSection {
                section_type,
                name: name.filter(|n| !n.is_empty()),
                options: HashMap::new(),
                lists: HashMap::new(),
            });
            continue;
        }

        if let Some(section) = current.as_mut() {
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some((key, value)) = split_key_value(rest) {
                    section.options.insert(key, value);
                }
            } else if let Some(rest) = line.strip_prefix("list ") {
                if let Some((key, value)) = split_key_value(rest) {
                    section.lists.entry(key).or_default().push(value);
                }
            }
        }
    }

    if let Some(section) = current.take() {
        sections.push(section);
    }

    sections
}

/// Render sections back to the tokenizer's own text format. Round-trips
/// anything `parse_raw` produced; used by the controller to rewrite the
/// policy engine's member weights with a minimal diff against the original
/// document (comments and section ordering are not preserved).
pub fn render_sections(sections: &[RawSection]) -> String {
    let mut out = String::new();
    for section in sections {
        match &section.name {
            Some(name) => out.push_str(&format!("config {} '{}'\n", section.section_type, name)),
            None => out.push_str(&format!("config {}\n", section.section_type)),
        }
        for (key, value) in &section.options {
            out.push_str(&format!("\toption {key} '{value}'\n"));
        }
        for (key, values) in &section.lists {
            for value in values {
                out.push_str(&format!("\tlist {key} '{value}'\n"));
            }
        }
        out.push('\n');
    }
    out
}

fn split_key_value(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let key = parts.next()?.to_string();
    let value = unquote(parts.next().unwrap_or_default().trim());
    Some((key, value))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
        || (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// A single out-of-range or unrecognized option, surfaced as a WARN event by
/// the caller (the validation rule in section 6).
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub section: String,
    pub option: String,
    pub offending_value: String,
    pub applied_default: String,
}

/// Accumulates warnings produced while resolving `Input` structs into
/// `Config` structs.
#[derive(Debug, Default)]
pub struct ResolveCtx {
    pub warnings: Vec<ConfigWarning>,
}

impl ResolveCtx {
    fn warn(
        &mut self,
        section: &str,
        option: &str,
        offending_value: impl std::fmt::Display,
        applied_default: impl std::fmt::Display,
    ) {
        self.warnings.push(ConfigWarning {
            section: section.to_string(),
            option: option.to_string(),
            offending_value: offending_value.to_string(),
            applied_default: applied_default.to_string(),
        });
    }
}

/// Parse a numeric option, clamping to `[min, max]` and recording a WARN
/// when the raw value was missing, unparsable, or out of range.
fn resolve_num<T>(
    ctx: &mut ResolveCtx,
    section: &str,
    option: &str,
    raw: Option<&String>,
    default: T,
    min: T,
    max: T,
) -> T
where
    T: PartialOrd + Copy + std::str::FromStr + std::fmt::Display,
{
    match raw {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) if v >= min && v <= max => v,
            Ok(v) => {
                ctx.warn(section, option, v, default);
                default
            }
            Err(_) => {
                ctx.warn(section, option, raw, default);
                default
            }
        },
    }
}

fn resolve_bool(ctx: &mut ResolveCtx, section: &str, option: &str, raw: Option<&String>, default: bool) -> bool {
    match raw {
        None => default,
        Some(raw) => match raw.trim() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                ctx.warn(section, option, other, default);
                default
            }
        },
    }
}

fn resolve_enum<T: Copy>(
    ctx: &mut ResolveCtx,
    section: &str,
    option: &str,
    raw: Option<&String>,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
    default_name: &str,
) -> T {
    match raw {
        None => default,
        Some(raw) => {
            let normalized = raw.to_ascii_lowercase();
            match parse(&normalized) {
                Some(v) => v,
                None => {
                    ctx.warn(section, option, raw, default_name);
                    default
                }
            }
        }
    }
}

// ─── main ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCapMode {
    Conservative,
    Balanced,
    Aggressive,
}

impl DataCapMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "conservative" => Some(DataCapMode::Conservative),
            "balanced" => Some(DataCapMode::Balanced),
            "aggressive" => Some(DataCapMode::Aggressive),
            _ => None,
        }
    }

    /// Cadence multiplier applied to `poll_interval_ms` (section 4.2).
    pub fn cadence_multiplier(&self) -> f64 {
        match self {
            DataCapMode::Conservative => 3.0,
            DataCapMode::Balanced => 1.0,
            DataCapMode::Aggressive => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Default)]
pub struct MainInput {
    pub enable: Option<String>,
    pub use_policy_engine: Option<String>,
    pub poll_interval_ms: Option<String>,
    pub history_window_s: Option<String>,
    pub retention_hours: Option<String>,
    pub max_ram_mb: Option<String>,
    pub max_samples_per_member: Option<String>,
    pub max_events: Option<String>,
    pub data_cap_mode: Option<String>,
    pub predictive: Option<String>,
    pub switch_margin: Option<String>,
    pub min_uptime_s: Option<String>,
    pub cooldown_s: Option<String>,
    pub fail_threshold_loss: Option<String>,
    pub fail_threshold_latency: Option<String>,
    pub fail_min_duration_s: Option<String>,
    pub restore_threshold_loss: Option<String>,
    pub restore_threshold_latency: Option<String>,
    pub restore_min_duration_s: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub health_listener: Option<String>,
    pub metrics_listener: Option<String>,
}

impl MainInput {
    pub fn from_raw(raw: &RawSection) -> Self {
        let o = &raw.options;
        MainInput {
            enable: o.get("enable").cloned(),
            use_policy_engine: o.get("use_policy_engine").cloned(),
            poll_interval_ms: o.get("poll_interval_ms").cloned(),
            history_window_s: o.get("history_window_s").cloned(),
            retention_hours: o.get("retention_hours").cloned(),
            max_ram_mb: o.get("max_ram_mb").cloned(),
            max_samples_per_member: o.get("max_samples_per_member").cloned(),
            max_events: o.get("max_events").cloned(),
            data_cap_mode: o.get("data_cap_mode").cloned(),
            predictive: o.get("predictive").cloned(),
            switch_margin: o.get("switch_margin").cloned(),
            min_uptime_s: o.get("min_uptime_s").cloned(),
            cooldown_s: o.get("cooldown_s").cloned(),
            fail_threshold_loss: o.get("fail_threshold_loss").cloned(),
            fail_threshold_latency: o.get("fail_threshold_latency").cloned(),
            fail_min_duration_s: o.get("fail_min_duration_s").cloned(),
            restore_threshold_loss: o.get("restore_threshold_loss").cloned(),
            restore_threshold_latency: o.get("restore_threshold_latency").cloned(),
            restore_min_duration_s: o.get("restore_min_duration_s").cloned(),
            log_level: o.get("log_level").cloned(),
            log_file: o.get("log_file").cloned(),
            health_listener: o.get("health_listener").cloned(),
            metrics_listener: o.get("metrics_listener").cloned(),
        }
    }

    pub fn resolve(&self, ctx: &mut ResolveCtx) -> MainConfig {
        MainConfig {
            enable: resolve_bool(ctx, "main", "enable", self.enable.as_ref(), true),
            use_policy_engine: resolve_bool(
                ctx,
                "main",
                "use_policy_engine",
                self.use_policy_engine.as_ref(),
                true,
            ),
            poll_interval_ms: resolve_num(
                ctx,
                "main",
                "poll_interval_ms",
                self.poll_interval_ms.as_ref(),
                1500u64,
                250,
                60_000,
            ),
            history_window_s: resolve_num(
                ctx,
                "main",
                "history_window_s",
                self.history_window_s.as_ref(),
                300u64,
                10,
                86_400,
            ),
            retention_hours: resolve_num(
                ctx,
                "main",
                "retention_hours",
                self.retention_hours.as_ref(),
                24u64,
                1,
                168,
            ),
            max_ram_mb: resolve_num(ctx, "main", "max_ram_mb", self.max_ram_mb.as_ref(), 16u64, 1, 512),
            max_samples_per_member: resolve_num(
                ctx,
                "main",
                "max_samples_per_member",
                self.max_samples_per_member.as_ref(),
                2000usize,
                10,
                1_000_000,
            ),
            max_events: resolve_num(
                ctx,
                "main",
                "max_events",
                self.max_events.as_ref(),
                1000usize,
                10,
                1_000_000,
            ),
            data_cap_mode: resolve_enum(
                ctx,
                "main",
                "data_cap_mode",
                self.data_cap_mode.as_ref(),
                DataCapMode::Balanced,
                DataCapMode::parse,
                "balanced",
            ),
            predictive: resolve_bool(ctx, "main", "predictive", self.predictive.as_ref(), true),
            switch_margin: resolve_num(
                ctx,
                "main",
                "switch_margin",
                self.switch_margin.as_ref(),
                10.0f64,
                0.0,
                100.0,
            ),
            min_uptime_s: resolve_num(
                ctx,
                "main",
                "min_uptime_s",
                self.min_uptime_s.as_ref(),
                30u64,
                0,
                86_400,
            ),
            cooldown_s: resolve_num(ctx, "main", "cooldown_s", self.cooldown_s.as_ref(), 60u64, 0, 86_400),
            fail_threshold_loss: resolve_num(
                ctx,
                "main",
                "fail_threshold_loss",
                self.fail_threshold_loss.as_ref(),
                5.0f64,
                0.0,
                100.0,
            ),
            fail_threshold_latency: resolve_num(
                ctx,
                "main",
                "fail_threshold_latency",
                self.fail_threshold_latency.as_ref(),
                500.0f64,
                0.0,
                60_000.0,
            ),
            fail_min_duration_s: resolve_num(
                ctx,
                "main",
                "fail_min_duration_s",
                self.fail_min_duration_s.as_ref(),
                10u64,
                0,
                3_600,
            ),
            restore_threshold_loss: resolve_num(
                ctx,
                "main",
                "restore_threshold_loss",
                self.restore_threshold_loss.as_ref(),
                1.0f64,
                0.0,
                100.0,
            ),
            restore_threshold_latency: resolve_num(
                ctx,
                "main",
                "restore_threshold_latency",
                self.restore_threshold_latency.as_ref(),
                150.0f64,
                0.0,
                60_000.0,
            ),
            restore_min_duration_s: resolve_num(
                ctx,
                "main",
                "restore_min_duration_s",
                self.restore_min_duration_s.as_ref(),
                30u64,
                0,
                3_600,
            ),
            log_level: resolve_enum(
                ctx,
                "main",
                "log_level",
                self.log_level.as_ref(),
                LogLevel::Info,
                LogLevel::parse,
                "info",
            ),
            log_file: self.log_file.clone().unwrap_or_default(),
            health_listener: resolve_bool(
                ctx,
                "main",
                "health_listener",
                self.health_listener.as_ref(),
                false,
            ),
            metrics_listener: resolve_bool(
                ctx,
                "main",
                "metrics_listener",
                self.metrics_listener.as_ref(),
                false,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MainConfig {
    pub enable: bool,
    pub use_policy_engine: bool,
    pub poll_interval_ms: u64,
    pub history_window_s: u64,
    pub retention_hours: u64,
    pub max_ram_mb: u64,
    pub max_samples_per_member: usize,
    pub max_events: usize,
    pub data_cap_mode: DataCapMode,
    pub predictive: bool,
    pub switch_margin: f64,
    pub min_uptime_s: u64,
    pub cooldown_s: u64,
    pub fail_threshold_loss: f64,
    pub fail_threshold_latency: f64,
    pub fail_min_duration_s: u64,
    pub restore_threshold_loss: f64,
    pub restore_threshold_latency: f64,
    pub restore_min_duration_s: u64,
    pub log_level: LogLevel,
    pub log_file: String,
    pub health_listener: bool,
    pub metrics_listener: bool,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainInput::default().resolve(&mut ResolveCtx::default())
    }
}

// ─── scoring ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ScoringInput {
    pub weight_latency: Option<String>,
    pub weight_loss: Option<String>,
    pub weight_jitter: Option<String>,
    pub weight_obstruction: Option<String>,
    pub latency_ok_ms: Option<String>,
    pub latency_bad_ms: Option<String>,
    pub loss_ok_pct: Option<String>,
    pub loss_bad_pct: Option<String>,
    pub jitter_ok_ms: Option<String>,
    pub jitter_bad_ms: Option<String>,
    pub obstruction_ok_pct: Option<String>,
    pub obstruction_bad_pct: Option<String>,
}

impl ScoringInput {
    pub fn from_raw(raw: &RawSection) -> Self {
        let o = &raw.options;
        ScoringInput {
            weight_latency: o.get("weight_latency").cloned(),
            weight_loss: o.get("weight_loss").cloned(),
            weight_jitter: o.get("weight_jitter").cloned(),
            weight_obstruction: o.get("weight_obstruction").cloned(),
            latency_ok_ms: o.get("latency_ok_ms").cloned(),
            latency_bad_ms: o.get("latency_bad_ms").cloned(),
            loss_ok_pct: o.get("loss_ok_pct").cloned(),
            loss_bad_pct: o.get("loss_bad_pct").cloned(),
            jitter_ok_ms: o.get("jitter_ok_ms").cloned(),
            jitter_bad_ms: o.get("jitter_bad_ms").cloned(),
            obstruction_ok_pct: o.get("obstruction_ok_pct").cloned(),
            obstruction_bad_pct: o.get("obstruction_bad_pct").cloned(),
        }
    }

    pub fn resolve(&self, ctx: &mut ResolveCtx) -> ScoringConfig {
        ScoringConfig {
            weight_latency: resolve_num(
                ctx,
                "scoring",
                "weight_latency",
                self.weight_latency.as_ref(),
                0.25,
                0.0,
                1.0,
            ),
            weight_loss: resolve_num(ctx, "scoring", "weight_loss", self.weight_loss.as_ref(), 0.30, 0.0, 1.0),
            weight_jitter: resolve_num(
                ctx,
                "scoring",
                "weight_jitter",
                self.weight_jitter.as_ref(),
                0.15,
                0.0,
                1.0,
            ),
            weight_obstruction: resolve_num(
                ctx,
                "scoring",
                "weight_obstruction",
                self.weight_obstruction.as_ref(),
                0.20,
                0.0,
                1.0,
            ),
            latency_ok_ms: resolve_num(
                ctx,
                "scoring",
                "latency_ok_ms",
                self.latency_ok_ms.as_ref(),
                50.0,
                0.0,
                60_000.0,
            ),
            latency_bad_ms: resolve_num(
                ctx,
                "scoring",
                "latency_bad_ms",
                self.latency_bad_ms.as_ref(),
                1500.0,
                0.0,
                60_000.0,
            ),
            loss_ok_pct: resolve_num(ctx, "scoring", "loss_ok_pct", self.loss_ok_pct.as_ref(), 0.0, 0.0, 100.0),
            loss_bad_pct: resolve_num(
                ctx,
                "scoring",
                "loss_bad_pct",
                self.loss_bad_pct.as_ref(),
                10.0,
                0.0,
                100.0,
            ),
            jitter_ok_ms: resolve_num(
                ctx,
                "scoring",
                "jitter_ok_ms",
                self.jitter_ok_ms.as_ref(),
                5.0,
                0.0,
                60_000.0,
            ),
            jitter_bad_ms: resolve_num(
                ctx,
                "scoring",
                "jitter_bad_ms",
                self.jitter_bad_ms.as_ref(),
                200.0,
                0.0,
                60_000.0,
            ),
            obstruction_ok_pct: resolve_num(
                ctx,
                "scoring",
                "obstruction_ok_pct",
                self.obstruction_ok_pct.as_ref(),
                0.0,
                0.0,
                100.0,
            ),
            obstruction_bad_pct: resolve_num(
                ctx,
                "scoring",
                "obstruction_bad_pct",
                self.obstruction_bad_pct.as_ref(),
                10.0,
                0.0,
                100.0,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    pub weight_latency: f64,
    pub weight_loss: f64,
    pub weight_jitter: f64,
    pub weight_obstruction: f64,
    pub latency_ok_ms: f64,
    pub latency_bad_ms: f64,
    pub loss_ok_pct: f64,
    pub loss_bad_pct: f64,
    pub jitter_ok_ms: f64,
    pub jitter_bad_ms: f64,
    pub obstruction_ok_pct: f64,
    pub obstruction_bad_pct: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringInput::default().resolve(&mut ResolveCtx::default())
    }
}

// ─── satellite ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SatelliteInput {
    pub dish_ip: Option<String>,
    pub dish_port: Option<String>,
}

impl SatelliteInput {
    pub fn from_raw(raw: &RawSection) -> Self {
        SatelliteInput {
            dish_ip: raw.options.get("dish_ip").cloned(),
            dish_port: raw.options.get("dish_port").cloned(),
        }
    }

    pub fn resolve(&self, ctx: &mut ResolveCtx) -> SatelliteConfig {
        SatelliteConfig {
            dish_ip: self
                .dish_ip
                .clone()
                .unwrap_or_else(|| "192.168.100.1".to_string()),
            dish_port: resolve_num(
                ctx,
                "satellite",
                "dish_port",
                self.dish_port.as_ref(),
                9200u16,
                1,
                65535,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    pub dish_ip: String,
    pub dish_port: u16,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        SatelliteInput::default().resolve(&mut ResolveCtx::default())
    }
}

// ─── member ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemberInput {
    pub name: String,
    pub detect: Option<String>,
    pub class: Option<String>,
    pub weight: Option<String>,
    pub min_uptime_s: Option<String>,
    pub cooldown_s: Option<String>,
    pub metered: Option<String>,
    pub prefer_roaming: Option<String>,
}

impl MemberInput {
    pub fn from_raw(raw: &RawSection) -> Self {
        MemberInput {
            name: raw.name.clone().unwrap_or_default(),
            detect: raw.options.get("detect").cloned(),
            class: raw.options.get("class").cloned(),
            weight: raw.options.get("weight").cloned(),
            min_uptime_s: raw.options.get("min_uptime_s").cloned(),
            cooldown_s: raw.options.get("cooldown_s").cloned(),
            metered: raw.options.get("metered").cloned(),
            prefer_roaming: raw.options.get("prefer_roaming").cloned(),
        }
    }

    pub fn resolve(&self, ctx: &mut ResolveCtx) -> MemberConfig {
        let section = format!("member[{}]", self.name);
        MemberConfig {
            name: self.name.clone(),
            detect: resolve_enum(
                ctx,
                &section,
                "detect",
                self.detect.as_ref(),
                DetectMode::Auto,
                DetectMode::parse,
                "auto",
            ),
            class: resolve_enum(
                ctx,
                &section,
                "class",
                self.class.as_ref(),
                Class::Other,
                Class::parse,
                "other",
            ),
            weight: resolve_num(ctx, &section, "weight", self.weight.as_ref(), 50u8, 0, 100),
            min_uptime_s: resolve_num(
                ctx,
                &section,
                "min_uptime_s",
                self.min_uptime_s.as_ref(),
                30u64,
                0,
                86_400,
            ),
            cooldown_s: resolve_num(
                ctx,
                &section,
                "cooldown_s",
                self.cooldown_s.as_ref(),
                60u64,
                0,
                86_400,
            ),
            metered: resolve_bool(ctx, &section, "metered", self.metered.as_ref(), false),
            prefer_roaming: resolve_bool(ctx, &section, "prefer_roaming", self.prefer_roaming.as_ref(), false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberConfig {
    pub name: String,
    pub detect: DetectMode,
    pub class: Class,
    pub weight: u8,
    pub min_uptime_s: u64,
    pub cooldown_s: u64,
    pub metered: bool,
    pub prefer_roaming: bool,
}

// ─── top-level config snapshot ──────────────────────────────────────────

/// The fully resolved, immutable configuration for one tick generation.
/// Replaced atomically on reload (see `supervisor::ConfigHandle` in the
/// daemon crate, backed by `arc_swap::ArcSwap`).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub main: MainConfig,
    pub scoring: ScoringConfig,
    pub satellite: SatelliteConfig,
    pub members: Vec<MemberConfig>,
}

impl Config {
    /// Parse and resolve a full host config store document. Returns the
    /// config plus every warning raised while resolving it, so the caller
    /// can turn each into a `config_reload`/WARN event.
    pub fn from_str(text: &str) -> (Config, Vec<ConfigWarning>) {
        let raw_sections = parse_raw(text);
        let mut ctx = ResolveCtx::default();

        let mut main = MainConfig::default();
        let mut scoring = ScoringConfig::default();
        let mut satellite = SatelliteConfig::default();
        let mut members = Vec::new();

        for raw in &raw_sections {
            match raw.section_type.as_str() {
                "main" => main = MainInput::from_raw(raw).resolve(&mut ctx),
                "scoring" => scoring = ScoringInput::from_raw(raw).resolve(&mut ctx),
                "satellite" => satellite = SatelliteInput::from_raw(raw).resolve(&mut ctx),
                "member" => members.push(MemberInput::from_raw(raw).resolve(&mut ctx)),
                _ => {}
            }
        }

        (
            Config {
                main,
                scoring,
                satellite,
                members,
            },
            ctx.warnings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Tokenizer ───────────────────────────────────────────────────────

    #[test]
    fn parses_basic_sections() {
        let text = r#"
config main 'main'
	option enable '1'
	option poll_interval_ms '1500'

config member 'starlink'
	option class 'satellite'
	option weight '80'
"#;
        let sections = parse_raw(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_type, "main");
        assert_eq!(sections[0].options.get("poll_interval_ms").unwrap(), "1500");
        assert_eq!(sections[1].name.as_deref(), Some("starlink"));
        assert_eq!(sections[1].options.get("class").unwrap(), "satellite");
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = "# a comment\n\nconfig main 'main'\n\t# nested comment\n\toption enable '0'\n";
        let sections = parse_raw(text);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].options.get("enable").unwrap(), "0");
    }

    #[test]
    fn list_values_accumulate() {
        let text = "config main 'main'\n\tlist tag 'a'\n\tlist tag 'b'\n";
        let sections = parse_raw(text);
        assert_eq!(sections[0].lists.get("tag").unwrap(), &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unquoted_values_are_accepted() {
        let text = "config main 'main'\n\toption enable 1\n";
        let sections = parse_raw(text);
        assert_eq!(sections[0].options.get("enable").unwrap(), "1");
    }

    #[test]
    fn render_sections_round_trips_through_parse_raw() {
        let text = "config member 'starlink'\n\toption class 'satellite'\n\toption weight '80'\n";
        let sections = parse_raw(text);
        let rendered = render_sections(&sections);
        let reparsed = parse_raw(&rendered);
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0].name.as_deref(), Some("starlink"));
        assert_eq!(reparsed[0].options.get("weight").unwrap(), "80");
    }

    // ─── Defaulting / validation ─────────────────────────────────────────

    #[test]
    fn empty_document_yields_all_defaults() {
        let (cfg, warnings) = Config::from_str("");
        assert!(warnings.is_empty());
        assert_eq!(cfg.main.poll_interval_ms, 1500);
        assert!((cfg.scoring.weight_loss - 0.30).abs() < 1e-9);
        assert_eq!(cfg.satellite.dish_port, 9200);
    }

    #[test]
    fn out_of_range_numeric_falls_back_to_default_with_warning() {
        let text = "config main 'main'\n\toption poll_interval_ms '50'\n"; // below min 250
        let (cfg, warnings) = Config::from_str(text);
        assert_eq!(cfg.main.poll_interval_ms, 1500);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].option, "poll_interval_ms");
    }

    #[test]
    fn unparsable_numeric_falls_back_with_warning() {
        let text = "config main 'main'\n\toption max_ram_mb 'lots'\n";
        let (cfg, warnings) = Config::from_str(text);
        assert_eq!(cfg.main.max_ram_mb, 16);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_enum_string_normalizes_or_falls_back() {
        let text = "config main 'main'\n\toption data_cap_mode 'AGGRESSIVE'\n";
        let (cfg, warnings) = Config::from_str(text);
        assert_eq!(cfg.main.data_cap_mode, DataCapMode::Aggressive);
        assert!(warnings.is_empty(), "case-insensitive match should not warn");

        let text2 = "config main 'main'\n\toption data_cap_mode 'turbo'\n";
        let (cfg2, warnings2) = Config::from_str(text2);
        assert_eq!(cfg2.main.data_cap_mode, DataCapMode::Balanced);
        assert_eq!(warnings2.len(), 1);
    }

    #[test]
    fn member_sections_parse_and_default_missing_class_to_other() {
        let text = "config member 'wan1'\n\toption weight '70'\n";
        let (cfg, warnings) = Config::from_str(text);
        assert_eq!(cfg.members.len(), 1);
        assert_eq!(cfg.members[0].name, "wan1");
        assert_eq!(cfg.members[0].class, Class::Other);
        assert_eq!(cfg.members[0].weight, 70);
        assert!(warnings.is_empty(), "missing option is defaulted, not invalid");
    }

    #[test]
    fn multiple_member_sections_all_captured() {
        let text = "\
config member 'starlink'
	option class 'satellite'
	option weight '90'

config member 'cell0'
	option class 'cellular'
	option weight '60'
	option prefer_roaming '0'
";
        let (cfg, _) = Config::from_str(text);
        assert_eq!(cfg.members.len(), 2);
        assert_eq!(cfg.members[0].class, Class::Satellite);
        assert_eq!(cfg.members[1].class, Class::Cellular);
        assert!(!cfg.members[1].prefer_roaming);
    }

    #[test]
    fn cadence_multipliers_match_data_cap_modes() {
        assert!((DataCapMode::Conservative.cadence_multiplier() - 3.0).abs() < 1e-9);
        assert!((DataCapMode::Balanced.cadence_multiplier() - 1.0).abs() < 1e-9);
        assert!((DataCapMode::Aggressive.cadence_multiplier() - 0.5).abs() < 1e-9);
    }
}
