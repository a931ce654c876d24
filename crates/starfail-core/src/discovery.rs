//! Discovery (C6): maps the host config store's configured members onto
//! live [`Member`] records, classifying each by interface protocol when the
//! operator leaves `class` at its "other" default, and tracking add/remove
//! lifecycle across refreshes.
//!
//! Note on naming: the distilled member section carries no separate
//! `interface` option (see `config::MemberConfig`), so a member's section
//! name doubles as its underlying network interface name — the common case
//! on these router images where the policy engine's member and interface
//! names already match.

use std::collections::{HashMap, HashSet};

use crate::config::MemberConfig;
use crate::model::{Class, Event, EventKind, Member};

/// Filesystem/process probes used to auto-classify an interface. A trait so
/// tests can substitute a fake without touching `/sys`.
pub trait InterfaceInspector: Send + Sync {
    fn driver_name(&self, interface: &str) -> Option<String>;
    fn has_wireless(&self, interface: &str) -> bool;
    fn exists(&self, interface: &str) -> bool;
}

/// Real `/sys/class/net` backed inspector.
pub struct SysfsInspector;

impl InterfaceInspector for SysfsInspector {
    fn driver_name(&self, interface: &str) -> Option<String> {
        let uevent = std::fs::read_to_string(format!("/sys/class/net/{interface}/device/uevent")).ok()?;
        uevent
            .lines()
            .find_map(|line| line.strip_prefix("DRIVER=").map(|s| s.to_string()))
    }

    fn has_wireless(&self, interface: &str) -> bool {
        std::path::Path::new(&format!("/sys/class/net/{interface}/wireless")).is_dir()
    }

    fn exists(&self, interface: &str) -> bool {
        std::path::Path::new(&format!("/sys/class/net/{interface}")).is_dir()
    }
}

const CELLULAR_DRIVERS: [&str; 5] = ["qmi_wwan", "cdc_mbim", "cdc_ncm", "cdc_ether", "option"];

/// Resolve a member's class: an explicit non-`other` `class` option always
/// wins (the operator knows best); otherwise probe the interface.
///
/// `satellite_reachable` is a caller-supplied reachability result for the
/// configured satellite management address (section 4.6: "reachability to
/// the fixed management address of the known satellite modem"); it is
/// computed asynchronously by the caller since this function itself stays
/// synchronous.
pub fn classify(interface: &str, declared: Class, inspector: &dyn InterfaceInspector, satellite_reachable: bool) -> Class {
    if declared != Class::Other {
        return declared;
    }
    if inspector.has_wireless(interface) {
        return Class::Wifi;
    }
    if let Some(driver) = inspector.driver_name(interface) {
        if CELLULAR_DRIVERS.iter().any(|d| driver.contains(d)) {
            return Class::Cellular;
        }
    }
    if interface.starts_with("wwan") {
        return Class::Cellular;
    }
    if satellite_reachable {
        return Class::Satellite;
    }
    if inspector.exists(interface) {
        return Class::Lan;
    }
    Class::Other
}

pub struct Discovery {
    members: HashMap<String, Member>,
    missing_since: HashMap<String, u64>,
}

impl Discovery {
    pub fn new() -> Self {
        Discovery {
            members: HashMap::new(),
            missing_since: HashMap::new(),
        }
    }

    pub fn members(&self) -> &HashMap<String, Member> {
        &self.members
    }

    /// Copy the Decision engine's per-tick runtime fields back onto the
    /// canonical member records Discovery owns. Decision works off a cloned
    /// `Vec<Member>` (section 6: "every other component holds a copy
    /// refreshed each tick rather than a live reference"); this is the one
    /// write path back into that canonical copy.
    pub fn apply_runtime(&mut self, updated: &[Member]) {
        for member in updated {
            if let Some(entry) = self.members.get_mut(&member.name) {
                entry.eligible = member.eligible;
                entry.in_warmup = member.in_warmup;
                entry.in_cooldown = member.in_cooldown;
                entry.last_change = member.last_change;
            }
        }
    }

    /// Reconcile the live member table against `configured`, classifying new
    /// or changed members and dropping ones absent for `grace_ms` straight.
    /// Returns the lifecycle events this refresh produced.
    pub fn refresh(
        &mut self,
        now_ms: u64,
        configured: &[MemberConfig],
        inspector: &dyn InterfaceInspector,
        grace_ms: u64,
        satellite_reachable: bool,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for mc in configured {
            seen.insert(mc.name.clone());
            let interface = mc.name.clone();
            let class = classify(&interface, mc.class, inspector, satellite_reachable);
            let prev_class = self.members.get(&mc.name).map(|m| m.class);
            let is_new = !self.members.contains_key(&mc.name);

            let entry = self
                .members
                .entry(mc.name.clone())
                .or_insert_with(|| Member::new(mc.name.clone(), class, interface.clone()));
            entry.class = class;
            entry.weight = mc.weight;
            entry.detect = mc.detect;
            entry.metered = mc.metered;
            entry.prefer_roaming = mc.prefer_roaming;
            entry.min_uptime_s = mc.min_uptime_s;
            entry.cooldown_s = mc.cooldown_s;
            entry.last_seen = now_ms;
            self.missing_since.remove(&mc.name);

            if is_new {
                events.push(
                    Event::new(now_ms, EventKind::Discovery, "member_added")
                        .with_context(serde_json::json!({"name": mc.name, "class": class.as_str()})),
                );
            } else if prev_class != Some(class) {
                events.push(
                    Event::new(now_ms, EventKind::Discovery, "class_changed").with_context(serde_json::json!({
                        "name": mc.name,
                        "from": prev_class.map(|c| c.as_str()),
                        "to": class.as_str(),
                    })),
                );
            }
        }

        let known: Vec<String> = self.members.keys().cloned().collect();
        for name in known {
            if seen.contains(&name) {
                continue;
            }
            let missing_at = *self.missing_since.entry(name.clone()).or_insert(now_ms);
            if now_ms.saturating_sub(missing_at) >= grace_ms {
                self.members.remove(&name);
                self.missing_since.remove(&name);
                events.push(
                    Event::new(now_ms, EventKind::Discovery, "member_removed")
                        .with_context(serde_json::json!({"name": name})),
                );
            }
        }

        events
    }

    /// Insert a member that isn't present in `configured` — used for
    /// cellular multi-SIM slot expansion, where one configured member's
    /// modem reports more than one SIM slot and each slot becomes its own
    /// `Member` (section 4.2: "enumerate all modem slots... each becomes
    /// its own Member"). The caller is responsible for keeping it alive
    /// across refreshes with [`Discovery::keep_alive`].
    pub fn insert_synthetic_member(&mut self, member: Member) {
        self.missing_since.remove(&member.name);
        self.members.insert(member.name.clone(), member);
    }

    /// Remove a member outside the normal grace-period lifecycle, e.g. when
    /// its parent configured member (a multi-SIM modem) disappears.
    pub fn remove_member(&mut self, name: &str) {
        self.members.remove(name);
        self.missing_since.remove(name);
    }

    /// Clear a member's missing-since timer without it appearing in
    /// `configured`. Synthetic slot members aren't declared in the host
    /// config store, so `refresh` would otherwise start reaping them on the
    /// very next call; the supervisor calls this once per refresh for every
    /// slot member it still considers live.
    pub fn keep_alive(&mut self, name: &str) {
        self.missing_since.remove(name);
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberConfig;
    use crate::model::DetectMode;

    struct FakeInspector {
        wireless: HashSet<String>,
        drivers: HashMap<String, String>,
        present: HashSet<String>,
    }

    impl InterfaceInspector for FakeInspector {
        fn driver_name(&self, interface: &str) -> Option<String> {
            self.drivers.get(interface).cloned()
        }
        fn has_wireless(&self, interface: &str) -> bool {
            self.wireless.contains(interface)
        }
        fn exists(&self, interface: &str) -> bool {
            self.present.contains(interface)
        }
    }

    fn member_cfg(name: &str, class: Class) -> MemberConfig {
        MemberConfig {
            name: name.to_string(),
            detect: DetectMode::Auto,
            class,
            weight: 50,
            min_uptime_s: 30,
            cooldown_s: 60,
            metered: false,
            prefer_roaming: false,
        }
    }

    // ─── classify ────────────────────────────────────────────────────────

    #[test]
    fn explicit_class_always_wins() {
        let inspector = FakeInspector {
            wireless: HashSet::from(["eth0".to_string()]),
            drivers: HashMap::new(),
            present: HashSet::new(),
        };
        assert_eq!(classify("eth0", Class::Lan, &inspector, false), Class::Lan);
    }

    #[test]
    fn wireless_dir_implies_wifi() {
        let inspector = FakeInspector {
            wireless: HashSet::from(["wlan0".to_string()]),
            drivers: HashMap::new(),
            present: HashSet::new(),
        };
        assert_eq!(classify("wlan0", Class::Other, &inspector, false), Class::Wifi);
    }

    #[test]
    fn cellular_driver_name_implies_cellular() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::from([("wwan0".to_string(), "qmi_wwan".to_string())]),
            present: HashSet::new(),
        };
        assert_eq!(classify("wwan0", Class::Other, &inspector, false), Class::Cellular);
    }

    #[test]
    fn plain_existing_interface_defaults_to_lan() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["eth0".to_string()]),
        };
        assert_eq!(classify("eth0", Class::Other, &inspector, false), Class::Lan);
    }

    #[test]
    fn reachable_satellite_management_address_implies_satellite() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["eth1".to_string()]),
        };
        assert_eq!(classify("eth1", Class::Other, &inspector, true), Class::Satellite);
    }

    // ─── refresh lifecycle ───────────────────────────────────────────────

    #[test]
    fn new_member_is_discovered() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["starlink".to_string()]),
        };
        let mut discovery = Discovery::new();
        let events = discovery.refresh(1_000, &[member_cfg("starlink", Class::Satellite)], &inspector, 5_000, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "member_added");
        assert!(discovery.members().contains_key("starlink"));
    }

    #[test]
    fn class_change_is_reported() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["wan0".to_string()]),
        };
        let mut discovery = Discovery::new();
        discovery.refresh(1_000, &[member_cfg("wan0", Class::Cellular)], &inspector, 5_000, false);
        let events = discovery.refresh(2_000, &[member_cfg("wan0", Class::Lan)], &inspector, 5_000, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "class_changed");
    }

    #[test]
    fn missing_member_is_removed_only_after_grace_period() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["wan0".to_string()]),
        };
        let mut discovery = Discovery::new();
        discovery.refresh(1_000, &[member_cfg("wan0", Class::Lan)], &inspector, 5_000, false);

        let events_within_grace = discovery.refresh(3_000, &[], &inspector, 5_000, false);
        assert!(events_within_grace.is_empty());
        assert!(discovery.members().contains_key("wan0"));

        let events_after_grace = discovery.refresh(7_000, &[], &inspector, 5_000, false);
        assert_eq!(events_after_grace.len(), 1);
        assert_eq!(events_after_grace[0].reason, "member_removed");
        assert!(!discovery.members().contains_key("wan0"));
    }

    #[test]
    fn apply_runtime_writes_back_eligibility_fields() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["wan0".to_string()]),
        };
        let mut discovery = Discovery::new();
        discovery.refresh(1_000, &[member_cfg("wan0", Class::Lan)], &inspector, 5_000, false);

        let mut updated = discovery.members().get("wan0").cloned().unwrap();
        updated.eligible = true;
        updated.in_warmup = false;
        discovery.apply_runtime(&[updated]);

        let stored = discovery.members().get("wan0").unwrap();
        assert!(stored.eligible);
        assert!(!stored.in_warmup);
    }

    #[test]
    fn member_reappearing_before_grace_elapses_cancels_removal() {
        let inspector = FakeInspector {
            wireless: HashSet::new(),
            drivers: HashMap::new(),
            present: HashSet::from(["wan0".to_string()]),
        };
        let mut discovery = Discovery::new();
        discovery.refresh(1_000, &[member_cfg("wan0", Class::Lan)], &inspector, 5_000, false);
        discovery.refresh(3_000, &[], &inspector, 5_000, false);
        let events = discovery.refresh(4_000, &[member_cfg("wan0", Class::Lan)], &inspector, 5_000, false);
        assert!(events.is_empty());
        assert!(discovery.members().contains_key("wan0"));
    }
}
