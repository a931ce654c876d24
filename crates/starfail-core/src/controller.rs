//! Controller (C5): makes the decided primary effective, either by driving
//! the host policy-routing engine or, as a fallback, by mutating kernel
//! route metrics directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{parse_raw, render_sections, RawSection};
use crate::error::StarfailError;

const COALESCE_WINDOW_MS: u64 = 500;
const STABILIZATION_GRACE_MS: u64 = 3_000;
const STABILIZATION_POLL_ATTEMPTS: u32 = 5;
const STABILIZATION_POLL_INTERVAL_MS: u64 = 1_000;
const FORCED_FALLBACK_DURATION_MS: u64 = 5 * 60 * 1_000;

/// Talks to the host's config store and reload mechanism. A trait so tests
/// can substitute an in-memory double instead of shelling out.
#[async_trait::async_trait]
pub trait PolicyEngineHost: Send + Sync {
    async fn read_config(&self) -> Result<String, StarfailError>;
    async fn write_config(&self, text: &str) -> Result<(), StarfailError>;
    async fn reload(&self) -> Result<(), StarfailError>;
    /// Current effective primary as last reported by the running engine,
    /// used to verify a reload actually took.
    async fn effective_primary(&self) -> Result<Option<String>, StarfailError>;
}

/// Talks to the kernel routing table. A trait for the same reason.
#[async_trait::async_trait]
pub trait RouteTableHost: Send + Sync {
    /// `(interface, metric)` pairs for every default route currently installed.
    async fn default_routes(&self) -> Result<Vec<(String, u32)>, StarfailError>;
    async fn replace_metric(&self, interface: &str, metric: u32) -> Result<(), StarfailError>;
    async fn remove_default_route(&self, interface: &str) -> Result<(), StarfailError>;
}

/// Real policy engine host: a member's section is named after its interface,
/// and "preferred" is expressed as a high `weight` option on that section
/// relative to the rest — mirroring the config-store idiom in `config.rs`.
pub struct UciPolicyEngineHost {
    pub config_path: String,
    pub reload_binary: String,
    pub status_path: String,
}

#[async_trait::async_trait]
impl PolicyEngineHost for UciPolicyEngineHost {
    async fn read_config(&self) -> Result<String, StarfailError> {
        tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("read {}: {e}", self.config_path) })
    }

    async fn write_config(&self, text: &str) -> Result<(), StarfailError> {
        tokio::fs::write(&self.config_path, text)
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("write {}: {e}", self.config_path) })
    }

    async fn reload(&self) -> Result<(), StarfailError> {
        let status = tokio::process::Command::new(&self.reload_binary)
            .output()
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("spawn reload: {e}") })?;
        if !status.status.success() {
            return Err(StarfailError::ControllerConflict {
                detail: format!("reload exited {:?}", status.status.code()),
            });
        }
        Ok(())
    }

    async fn effective_primary(&self) -> Result<Option<String>, StarfailError> {
        match tokio::fs::read_to_string(&self.status_path).await {
            Ok(text) => Ok(text.lines().next().map(|l| l.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StarfailError::ControllerConflict { detail: format!("read {}: {e}", self.status_path) }),
        }
    }
}

/// Real route table host backed by `ip route` from iproute2.
pub struct IpRouteHost;

#[async_trait::async_trait]
impl RouteTableHost for IpRouteHost {
    async fn default_routes(&self) -> Result<Vec<(String, u32)>, StarfailError> {
        let output = tokio::process::Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("ip route show: {e}") })?;
        if !output.status.success() {
            return Err(StarfailError::ControllerConflict { detail: "ip route show failed".to_string() });
        }
        Ok(parse_default_routes(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn replace_metric(&self, interface: &str, metric: u32) -> Result<(), StarfailError> {
        let status = tokio::process::Command::new("ip")
            .args(["route", "replace", "default", "dev", interface, "metric", &metric.to_string()])
            .status()
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("ip route replace: {e}") })?;
        if !status.success() {
            return Err(StarfailError::ControllerConflict { detail: format!("ip route replace dev {interface} failed") });
        }
        Ok(())
    }

    async fn remove_default_route(&self, interface: &str) -> Result<(), StarfailError> {
        let status = tokio::process::Command::new("ip")
            .args(["route", "del", "default", "dev", interface])
            .status()
            .await
            .map_err(|e| StarfailError::ControllerConflict { detail: format!("ip route del: {e}") })?;
        if !status.success() {
            return Err(StarfailError::ControllerConflict { detail: format!("ip route del dev {interface} failed") });
        }
        Ok(())
    }
}

fn parse_default_routes(text: &str) -> Vec<(String, u32)> {
    let mut routes = Vec::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let interface = tokens
            .iter()
            .position(|t| *t == "dev")
            .and_then(|i| tokens.get(i + 1))
            .map(|s| s.to_string());
        let metric = tokens
            .iter()
            .position(|t| *t == "metric")
            .and_then(|i| tokens.get(i + 1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if let Some(interface) = interface {
            routes.push((interface, metric));
        }
    }
    routes
}

const PREFERRED_WEIGHT: &str = "200";
const DEMOTED_WEIGHT: &str = "10";

/// Member section names to rewrite when applying a policy-engine mutation.
/// `target` gets `PREFERRED_WEIGHT`, everyone else gets `DEMOTED_WEIGHT`.
fn mutate_weights(sections: &[RawSection], target: &str, all_members: &[String]) -> Vec<RawSection> {
    let mut out = sections.to_vec();
    for name in all_members {
        let weight = if name == target { PREFERRED_WEIGHT } else { DEMOTED_WEIGHT };
        if let Some(section) = out
            .iter_mut()
            .find(|s| s.section_type == "member" && s.name.as_deref() == Some(name.as_str()))
        {
            section.options.insert("weight".to_string(), weight.to_string());
        }
    }
    out
}

/// Which strategy is currently driving switches. The controller starts in
/// whichever the config names and falls back to route-metric mutation for
/// `FORCED_FALLBACK_DURATION_MS` after a `ControllerConflict` from the
/// policy engine, per section 4.5/7.
enum ActiveStrategy {
    PolicyEngine,
    RouteMetric { forced_until_ms: Option<u64> },
}

pub struct Controller {
    policy_host: Option<Box<dyn PolicyEngineHost>>,
    route_host: Box<dyn RouteTableHost>,
    strategy: ActiveStrategy,
    dry_run: bool,
    last_call_at: Option<Instant>,
    pub current_primary: Option<String>,
}

impl Controller {
    pub fn new(
        policy_host: Option<Box<dyn PolicyEngineHost>>,
        route_host: Box<dyn RouteTableHost>,
        use_policy_engine: bool,
        dry_run: bool,
    ) -> Self {
        let strategy = if use_policy_engine && policy_host.is_some() {
            ActiveStrategy::PolicyEngine
        } else {
            ActiveStrategy::RouteMetric { forced_until_ms: None }
        };
        Controller {
            policy_host,
            route_host,
            strategy,
            dry_run,
            last_call_at: None,
            current_primary: None,
        }
    }

    /// Make `target` the effective primary. Idempotent: a no-op if it
    /// already is. Coalesces calls arriving within `COALESCE_WINDOW_MS` of
    /// the previous one by treating them as already satisfied.
    pub async fn switch(&mut self, target: &str, all_members: &[String], now_ms: u64) -> Result<(), StarfailError> {
        if self.current_primary.as_deref() == Some(target) {
            return Ok(());
        }

        if let Some(last) = self.last_call_at {
            if last.elapsed() < Duration::from_millis(COALESCE_WINDOW_MS) {
                return Ok(());
            }
        }
        self.last_call_at = Some(Instant::now());

        if let ActiveStrategy::RouteMetric { forced_until_ms: Some(until) } = self.strategy {
            if now_ms >= until {
                self.strategy = ActiveStrategy::RouteMetric { forced_until_ms: None };
            }
        }

        let use_policy_engine =
            matches!(self.strategy, ActiveStrategy::PolicyEngine) && self.policy_host.is_some();

        let result = if use_policy_engine {
            self.switch_via_policy_engine(target, all_members).await
        } else {
            self.switch_via_route_metric(target, all_members).await
        };

        match result {
            Ok(()) => {
                self.current_primary = Some(target.to_string());
                Ok(())
            }
            Err(e) if use_policy_engine => {
                self.strategy = ActiveStrategy::RouteMetric { forced_until_ms: Some(now_ms + FORCED_FALLBACK_DURATION_MS) };
                tracing::warn!(error = %e, "policy engine switch failed, forcing route-metric fallback");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn switch_via_policy_engine(&self, target: &str, all_members: &[String]) -> Result<(), StarfailError> {
        let host = self.policy_host.as_ref().expect("checked by caller");
        let original = host.read_config().await?;
        let sections = parse_raw(&original);
        let mutated = mutate_weights(&sections, target, all_members);
        let rendered = render_sections(&mutated);

        if self.dry_run {
            tracing::info!(target, "dry-run: would rewrite policy engine weights and reload");
            return Ok(());
        }

        host.write_config(&rendered).await?;
        if let Err(e) = host.reload().await {
            let _ = host.write_config(&original).await;
            return Err(e);
        }

        tokio::time::sleep(Duration::from_millis(STABILIZATION_GRACE_MS)).await;
        for attempt in 0..STABILIZATION_POLL_ATTEMPTS {
            match host.effective_primary().await {
                Ok(Some(primary)) if primary == target => return Ok(()),
                Ok(_) if attempt + 1 < STABILIZATION_POLL_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(STABILIZATION_POLL_INTERVAL_MS)).await;
                }
                Ok(_) => break,
                Err(e) => return Err(e),
            }
        }

        let _ = host.write_config(&original).await;
        let _ = host.reload().await;
        Err(StarfailError::ControllerConflict { detail: format!("policy engine did not converge on {target}") })
    }

    async fn switch_via_route_metric(&self, target: &str, all_members: &[String]) -> Result<(), StarfailError> {
        if self.dry_run {
            tracing::info!(target, "dry-run: would rewrite default route metrics");
            return Ok(());
        }

        let routes = self.route_host.default_routes().await?;
        let mut by_interface: HashMap<&str, u32> = HashMap::new();
        for (interface, metric) in &routes {
            by_interface
                .entry(interface.as_str())
                .and_modify(|m| *m = (*m).min(*metric))
                .or_insert(*metric);
        }

        let seen: std::collections::HashSet<&str> =
            routes.iter().map(|(i, _)| i.as_str()).collect::<std::collections::HashSet<_>>();
        let mut duplicate_interfaces: HashMap<&str, u32> = HashMap::new();
        for (interface, _) in &routes {
            *duplicate_interfaces.entry(interface.as_str()).or_insert(0) += 1;
        }

        self.route_host.replace_metric(target, 1).await?;
        let mut next_metric = 2u32;
        for member in all_members {
            if member == target || !seen.contains(member.as_str()) {
                continue;
            }
            self.route_host.replace_metric(member, next_metric).await?;
            next_metric += 1;
        }
        for (interface, count) in duplicate_interfaces {
            if count > 1 && interface != target {
                let _ = self.route_host.remove_default_route(interface).await;
            }
        }

        let after = self.route_host.default_routes().await?;
        let lowest = after.iter().min_by_key(|(_, m)| *m).map(|(i, _)| i.clone());
        if lowest.as_deref() == Some(target) {
            Ok(())
        } else {
            Err(StarfailError::ControllerConflict { detail: format!("route metric for {target} did not take effect") })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakePolicyHost {
        config: Mutex<String>,
        effective: Mutex<Option<String>>,
        fail_reload: bool,
    }

    #[async_trait::async_trait]
    impl PolicyEngineHost for FakePolicyHost {
        async fn read_config(&self) -> Result<String, StarfailError> {
            Ok(self.config.lock().unwrap().clone())
        }
        async fn write_config(&self, text: &str) -> Result<(), StarfailError> {
            *self.config.lock().unwrap() = text.to_string();
            Ok(())
        }
        async fn reload(&self) -> Result<(), StarfailError> {
            if self.fail_reload {
                return Err(StarfailError::ControllerConflict { detail: "reload refused".to_string() });
            }
            let sections = parse_raw(&self.config.lock().unwrap());
            let target = sections
                .iter()
                .filter(|s| s.section_type == "member")
                .max_by_key(|s| s.options.get("weight").and_then(|w| w.parse::<u32>().ok()).unwrap_or(0))
                .and_then(|s| s.name.clone());
            *self.effective.lock().unwrap() = target;
            Ok(())
        }
        async fn effective_primary(&self) -> Result<Option<String>, StarfailError> {
            Ok(self.effective.lock().unwrap().clone())
        }
    }

    struct UnusedRouteHost;

    #[async_trait::async_trait]
    impl RouteTableHost for UnusedRouteHost {
        async fn default_routes(&self) -> Result<Vec<(String, u32)>, StarfailError> {
            Ok(vec![])
        }
        async fn replace_metric(&self, _interface: &str, _metric: u32) -> Result<(), StarfailError> {
            Ok(())
        }
        async fn remove_default_route(&self, _interface: &str) -> Result<(), StarfailError> {
            Ok(())
        }
    }

    fn fixture_config() -> String {
        "config member 'wan0'\n\toption weight '50'\n\nconfig member 'wan1'\n\toption weight '50'\n".to_string()
    }

    #[tokio::test]
    async fn switch_to_current_primary_is_a_noop() {
        let host = FakePolicyHost {
            config: Mutex::new(fixture_config()),
            effective: Mutex::new(None),
            fail_reload: false,
        };
        let mut controller = Controller::new(Some(Box::new(host)), Box::new(UnusedRouteHost), true, false);
        controller.current_primary = Some("wan0".to_string());
        let result = controller.switch("wan0", &["wan0".to_string(), "wan1".to_string()], 1_000).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn successful_policy_engine_switch_updates_current_primary() {
        let host = FakePolicyHost {
            config: Mutex::new(fixture_config()),
            effective: Mutex::new(None),
            fail_reload: false,
        };
        let mut controller = Controller::new(Some(Box::new(host)), Box::new(UnusedRouteHost), true, false);
        let result = controller.switch("wan1", &["wan0".to_string(), "wan1".to_string()], 1_000).await;
        assert!(result.is_ok());
        assert_eq!(controller.current_primary.as_deref(), Some("wan1"));
    }

    #[tokio::test]
    async fn reload_failure_rolls_back_and_forces_route_metric_fallback() {
        let host = FakePolicyHost {
            config: Mutex::new(fixture_config()),
            effective: Mutex::new(None),
            fail_reload: true,
        };
        let mut controller = Controller::new(Some(Box::new(host)), Box::new(UnusedRouteHost), true, false);
        let result = controller.switch("wan1", &["wan0".to_string(), "wan1".to_string()], 1_000).await;
        assert!(result.is_err());
        assert!(matches!(controller.strategy, ActiveStrategy::RouteMetric { .. }));
    }

    #[tokio::test]
    async fn dry_run_reports_success_without_mutating_config() {
        let host = FakePolicyHost {
            config: Mutex::new(fixture_config()),
            effective: Mutex::new(None),
            fail_reload: false,
        };
        let mut controller = Controller::new(Some(Box::new(host)), Box::new(UnusedRouteHost), true, true);
        let result = controller.switch("wan1", &["wan0".to_string(), "wan1".to_string()], 1_000).await;
        assert!(result.is_ok());
        assert_eq!(controller.current_primary.as_deref(), Some("wan1"));
    }

    #[test]
    fn parse_default_routes_extracts_interface_and_metric() {
        let text = "default via 192.0.2.1 dev wan0 metric 10\ndefault via 198.51.100.1 dev wan1 metric 20\n";
        let routes = parse_default_routes(text);
        assert_eq!(routes, vec![("wan0".to_string(), 10), ("wan1".to_string(), 20)]);
    }

    #[test]
    fn mutate_weights_prefers_target_and_demotes_rest() {
        let sections = parse_raw(&fixture_config());
        let mutated = mutate_weights(&sections, "wan1", &["wan0".to_string(), "wan1".to_string()]);
        let wan0 = mutated.iter().find(|s| s.name.as_deref() == Some("wan0")).unwrap();
        let wan1 = mutated.iter().find(|s| s.name.as_deref() == Some("wan1")).unwrap();
        assert_eq!(wan0.options.get("weight").unwrap(), DEMOTED_WEIGHT);
        assert_eq!(wan1.options.get("weight").unwrap(), PREFERRED_WEIGHT);
    }
}
