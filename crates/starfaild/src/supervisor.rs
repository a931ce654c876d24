//! The tick loop: Discovery -> per-member Collector.collect (parallel) ->
//! Scoring -> Decision -> Controller.Apply -> Telemetry.Record, driven by
//! one `tokio::time::interval` on the supervisor task. RPC handlers read
//! `Supervisor`'s published state through [`starfail_core::rpc::RpcBackend`]
//! and never take the tick lock for longer than a `try_lock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use starfail_core::action::{ActionCmd, ActionRateLimiter, ActionRequest};
use starfail_core::collectors::cellular::CellularCollector;
use starfail_core::collectors::lan::LanCollector;
use starfail_core::collectors::satellite::SatelliteCollector;
use starfail_core::collectors::wifi::WifiCollector;
use starfail_core::collectors::{cadence_ms, AnyCollector};
use starfail_core::config::Config;
use starfail_core::controller::{Controller, IpRouteHost, UciPolicyEngineHost};
use starfail_core::decision::DecisionEngine;
use starfail_core::discovery::{Discovery, SysfsInspector};
use starfail_core::error::{Backoff, StarfailError};
use starfail_core::model::{Class, Event, EventKind, Member, Sample};
use starfail_core::scoring::Scorer;
use starfail_core::telemetry::TelemetryStore;
use starfail_core::transport::select_transport;

const DISCOVERY_REFRESH_MS: u64 = 60_000;
const DISCOVERY_GRACE_MS: u64 = 30_000;

/// Everything the supervisor tick reads and writes, behind one lock held
/// across awaits only on the supervisor task itself (section 5: "controller
/// runs on the supervisor task, serialized").
struct SupervisorState {
    discovery: Discovery,
    collectors: HashMap<String, AnyCollector>,
    scorer: Scorer,
    decision: DecisionEngine,
    controller: Controller,
    latest: HashMap<String, Sample>,
    last_discovery_ms: Option<u64>,
    last_collected_ms: HashMap<String, u64>,
    backoff: HashMap<String, Backoff>,
}

pub struct Supervisor {
    state: Mutex<SupervisorState>,
    store: Arc<TelemetryStore>,
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, store: Arc<TelemetryStore>, dry_run: bool) -> Self {
        let policy_host: Option<Box<dyn starfail_core::controller::PolicyEngineHost>> = if config.main.use_policy_engine {
            Some(Box::new(UciPolicyEngineHost {
                config_path: "/etc/config/mwan3".to_string(),
                reload_binary: "mwan3".to_string(),
                status_path: "/tmp/starfail/mwan3_status".to_string(),
            }))
        } else {
            None
        };
        let controller = Controller::new(policy_host, Box::new(IpRouteHost), config.main.use_policy_engine, dry_run);

        let state = SupervisorState {
            discovery: Discovery::new(),
            collectors: HashMap::new(),
            scorer: Scorer::new(),
            decision: DecisionEngine::new(),
            controller,
            latest: HashMap::new(),
            last_discovery_ms: None,
            last_collected_ms: HashMap::new(),
            backoff: HashMap::new(),
        };

        Supervisor {
            state: Mutex::new(state),
            store,
            config,
        }
    }

    /// Run the tick loop until `shutdown` reports `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.main.poll_interval_ms));
        let tick_budget = Duration::from_millis((self.config.main.poll_interval_ms as f64 * 0.8) as u64);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = starfail_core::now_ms();
                    if tokio::time::timeout(tick_budget, self.tick(now_ms)).await.is_err() {
                        tracing::warn!("tick exceeded its budget, continuing with stale samples");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self, now_ms: u64) {
        let mut state = self.state.lock().await;

        let needs_discovery = state
            .last_discovery_ms
            .map(|t| now_ms.saturating_sub(t) >= DISCOVERY_REFRESH_MS)
            .unwrap_or(true);
        if needs_discovery {
            self.refresh_discovery(&mut state, now_ms).await;
            state.last_discovery_ms = Some(now_ms);
        }

        let members: Vec<Member> = state.discovery.members().values().cloned().collect();
        let mut scored = Vec::with_capacity(members.len());
        for member in &members {
            let Some(collector) = state.collectors.get(&member.name) else {
                continue;
            };

            let due = state
                .last_collected_ms
                .get(&member.name)
                .map(|t| now_ms.saturating_sub(*t) >= cadence_ms(self.config.main.poll_interval_ms, self.config.main.data_cap_mode, member.metered))
                .unwrap_or(true);
            let backoff_until = state
                .backoff
                .get(&member.name)
                .map(|b| b.current_ms())
                .unwrap_or(0);
            let held_back = backoff_until > 0
                && state
                    .last_collected_ms
                    .get(&member.name)
                    .map(|t| now_ms.saturating_sub(*t) < backoff_until)
                    .unwrap_or(false);

            if !due || held_back {
                if let Some(mut sample) = self.store.last_n_samples(&member.name, 1).into_iter().next() {
                    sample.stale = true;
                    scored.push((member.name.clone(), sample));
                }
                continue;
            }

            let mut sample = collector.collect(member, now_ms, 1_000).await;
            state.last_collected_ms.insert(member.name.clone(), now_ms);

            let backoff = state.backoff.entry(member.name.clone()).or_insert_with(Backoff::new);
            if sample.loss_pct >= 99.9 && sample.latency_ms.is_none() {
                backoff.next();
            } else {
                backoff.reset();
            }

            let recent: Vec<f64> = self.store.last_n_samples(&member.name, 32).iter().map(|s| s.instant).collect();
            state.scorer.score(member, &mut sample, &self.config.scoring, self.config.main.data_cap_mode, &recent);
            self.store.append_sample(&member.name, sample.clone());
            scored.push((member.name.clone(), sample));
        }
        state.latest = scored.into_iter().collect();

        let mut members_mut = members;
        let (decision, events) =
            state.decision.evaluate(now_ms, &mut members_mut, &state.latest, &self.store, &self.config.main);
        state.discovery.apply_runtime(&members_mut);

        for event in events {
            self.store.append_event(event);
        }

        if let Some(decision) = decision {
            let all_names: Vec<String> = members_mut.iter().map(|m| m.name.clone()).collect();
            match state.controller.switch(&decision.to, &all_names, now_ms).await {
                Ok(()) => state.decision.confirm_switch(&decision, now_ms),
                Err(e) => {
                    state.decision.revert_switch(&decision, now_ms);
                    self.store.append_event(
                        Event::new(now_ms, EventKind::ProviderError, "controller_switch_failed")
                            .with_context(serde_json::json!({"target": decision.to, "error": e.to_string()})),
                    );
                }
            }
        }
    }

    async fn refresh_discovery(&self, state: &mut SupervisorState, now_ms: u64) {
        let inspector = SysfsInspector;
        let dish_target = vec![self.config.satellite.dish_ip.clone()];
        let (dish_latency, _) = starfail_core::collectors::common::reachability_probe(&dish_target, 1_000).await;
        let satellite_reachable = dish_latency.is_some();
        let events = state.discovery.refresh(
            now_ms,
            &self.config.members,
            &inspector,
            DISCOVERY_GRACE_MS,
            satellite_reachable,
        );

        for event in &events {
            let Some(name) = event.context.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
                continue;
            };
            if event.reason == "member_added" {
                if let Some(member) = state.discovery.members().get(&name).cloned() {
                    let collector = self.build_collector(&member).await;
                    state.collectors.insert(name, collector);
                }
            } else if event.reason == "member_removed" {
                if let Some(collector) = state.collectors.remove(&name) {
                    collector.forget(&name);
                }
                state.scorer.forget(&name);
                state.decision.forget(&name);
                state.last_collected_ms.remove(&name);
                state.backoff.remove(&name);
                self.store.forget_member(&name);
            }
        }

        for event in events {
            self.store.append_event(event);
        }
    }

    async fn build_collector(&self, member: &Member) -> AnyCollector {
        match member.class {
            Class::Satellite => {
                let addr = format!("{}:{}", self.config.satellite.dish_ip, self.config.satellite.dish_port);
                let transport = select_transport("satellite", Some(&addr), Some("starfail-satellite-cli")).await;
                AnyCollector::Satellite(SatelliteCollector::new(transport, &self.config.satellite))
            }
            Class::Cellular => {
                let transport = select_transport("cellular", None, Some("starfail-cellular-cli")).await;
                AnyCollector::Cellular(CellularCollector::new(transport, default_probe_targets()))
            }
            Class::Wifi => AnyCollector::Wifi(WifiCollector::new(default_probe_targets())),
            Class::Lan | Class::Other => AnyCollector::Lan(LanCollector::new(default_probe_targets())),
        }
    }
}

fn default_probe_targets() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

/// [`starfail_core::rpc::RpcBackend`] implementation backed directly by the
/// live supervisor. Read methods use `try_lock` rather than blocking: a
/// request landing mid-tick just sees a briefly-stale or empty view instead
/// of stalling the tick loop.
pub struct SupervisorRpcBackend {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<TelemetryStore>,
    pub rate_limiter: ActionRateLimiter,
}

#[async_trait::async_trait]
impl starfail_core::rpc::RpcBackend for SupervisorRpcBackend {
    fn current_primary(&self) -> Option<String> {
        self.supervisor.state.try_lock().ok().and_then(|s| s.controller.current_primary.clone())
    }

    fn members(&self) -> Vec<Member> {
        self.supervisor
            .state
            .try_lock()
            .map(|s| s.discovery.members().values().cloned().collect())
            .unwrap_or_default()
    }

    fn latest_sample(&self, name: &str) -> Option<Sample> {
        self.supervisor.state.try_lock().ok().and_then(|s| s.latest.get(name).cloned())
    }

    fn ranking(&self) -> Vec<(String, f64)> {
        let Ok(state) = self.supervisor.state.try_lock() else {
            return Vec::new();
        };
        let mut ranking: Vec<(String, f64)> =
            state.latest.iter().map(|(name, sample)| (name.clone(), sample.r#final)).collect();
        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranking
    }

    async fn submit_action(&self, request: ActionRequest) -> Result<serde_json::Value, StarfailError> {
        self.rate_limiter.check(request.cmd)?;
        let now_ms = starfail_core::now_ms();

        match request.cmd {
            ActionCmd::Failover => {
                let target = request.name.ok_or_else(|| StarfailError::Config {
                    section: "action".to_string(),
                    option: "name".to_string(),
                    detail: "failover requires a target member name".to_string(),
                })?;
                let mut state = self.supervisor.state.lock().await;
                let all_names: Vec<String> = state.discovery.members().keys().cloned().collect();
                state.controller.switch(&target, &all_names, now_ms).await?;
                self.store.append_event(
                    Event::new(now_ms, EventKind::Switch, "manual_failover").with_from_to(None, Some(target.clone())),
                );
                Ok(serde_json::json!({"status": "ok", "target": target}))
            }
            ActionCmd::Restore | ActionCmd::Recheck | ActionCmd::Promote => {
                self.store.append_event(Event::new(now_ms, EventKind::ConfigReload, request.cmd.as_str()));
                Ok(serde_json::json!({"status": "acknowledged", "cmd": request.cmd.as_str()}))
            }
            ActionCmd::SetLevel => {
                self.store.append_event(
                    Event::new(now_ms, EventKind::ConfigReload, "set_level")
                        .with_context(serde_json::json!({"level": request.level})),
                );
                Ok(serde_json::json!({"status": "ok"}))
            }
        }
    }

    async fn set_config(&self, _text: String) -> Result<(), StarfailError> {
        Err(StarfailError::ControllerConflict { detail: "config.set is not yet wired to the host store".to_string() })
    }
}
