//! Telemetry store (C1): bounded RAM ring buffers for per-member samples and
//! process-wide events, with memory-cap enforcement via downsampling.
//!
//! Concurrency contract: one `Mutex` per member's sample ring (so collectors
//! for different members never contend with each other) plus one
//! process-wide `Mutex` for the event ring, all reachable without holding the
//! top-level map lock across I/O. Reads return owned copies; nothing inside
//! the store is ever aliased out to a caller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use tokio::sync::broadcast;

use crate::model::{Event, EventKind, Sample};

/// Rough fixed overhead assumed per stored sample/event, used only to
/// approximate `MemoryUsage()` — this store never needs byte-exact
/// accounting, only something monotonic enough to trigger downsampling
/// before the real process RSS grows unreasonably.
const APPROX_BYTES_PER_SAMPLE: u64 = 256;
const APPROX_BYTES_PER_EVENT: u64 = 384;

struct MemberRing {
    samples: VecDeque<Sample>,
}

/// The member an event is "about", used as half of the coalescing key.
/// Prefers `to` (the event's subject after a transition), falls back to
/// `from`, then an explicit `name` in `context`; process-wide events (no
/// member at all) coalesce under `None`.
fn coalesce_member(event: &Event) -> Option<String> {
    event
        .to
        .clone()
        .or_else(|| event.from.clone())
        .or_else(|| event.context.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()))
}

pub struct TelemetryStore {
    members: RwLock<HashMap<String, Mutex<MemberRing>>>,
    events: Mutex<VecDeque<Event>>,
    /// Staging buffer for (member, kind) coalescing (4.1: "events for that
    /// subscriber are coalesced, last-write-wins per (member,type), not
    /// queued unbounded"). Flushed into the ring/broadcast once per tick by
    /// [`TelemetryStore::flush_events`].
    staged: Mutex<HashMap<(Option<String>, EventKind), Event>>,
    max_samples_per_member: usize,
    max_events: usize,
    max_ram_bytes: u64,
    /// 4.1: the per-member ring is bounded by both `max_samples_per_member`
    /// and this age cutoff — whichever evicts a sample first.
    retention_ms: u64,
    last_memory_pressure_ms: Mutex<Option<u64>>,
    event_tx: broadcast::Sender<Event>,
}

impl TelemetryStore {
    pub fn new(max_samples_per_member: usize, max_events: usize, max_ram_mb: u64, retention_hours: u64) -> Self {
        let (event_tx, _rx) = broadcast::channel(256);
        TelemetryStore {
            members: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            staged: Mutex::new(HashMap::new()),
            max_samples_per_member,
            max_events,
            max_ram_bytes: max_ram_mb * 1024 * 1024,
            retention_ms: retention_hours * 3_600_000,
            last_memory_pressure_ms: Mutex::new(None),
            event_tx,
        }
    }

    /// Subscribe to the coalesced event broadcast stream (4.1: at-most-one
    /// in-flight per subscriber per `(member, type)`; events only reach the
    /// ring/subscribers once [`TelemetryStore::flush_events`] drains the
    /// staging buffer, so a flapping member can't flood either).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// O(1) amortized; evicts the oldest sample for this member when the
    /// ring is full by count, then again by age (4.1: bounded by both
    /// `max_samples_per_member` and `retention_hours`), using the new
    /// sample's own timestamp as "now" since collectors always append with
    /// a fresh `now_ms`.
    pub fn append_sample(&self, member: &str, sample: Sample) {
        let needs_insert = {
            let members = self.members.read().unwrap();
            !members.contains_key(member)
        };
        if needs_insert {
            let mut members = self.members.write().unwrap();
            members.entry(member.to_string()).or_insert_with(|| {
                Mutex::new(MemberRing {
                    samples: VecDeque::new(),
                })
            });
        }

        let cutoff = sample.timestamp_ms.saturating_sub(self.retention_ms);
        let members = self.members.read().unwrap();
        let mut ring = members.get(member).unwrap().lock().unwrap();
        if ring.samples.len() >= self.max_samples_per_member {
            ring.samples.pop_front();
        }
        while ring.samples.front().is_some_and(|s| s.timestamp_ms < cutoff) {
            ring.samples.pop_front();
        }
        ring.samples.push_back(sample);
    }

    /// Stage an event for the next [`TelemetryStore::flush_events`] call.
    /// Last write wins per `(member, EventKind)`: an unflushed event for the
    /// same key is replaced outright rather than queued, so a member
    /// flapping between states many times within one tick only ever
    /// produces the most recent state change.
    pub fn append_event(&self, event: Event) {
        let key = (coalesce_member(&event), event.kind);
        self.staged.lock().unwrap().insert(key, event);
    }

    /// Drain every staged event into the ring and broadcast it, oldest
    /// first by `timestamp_ms` for deterministic ordering. Called once per
    /// tick (and immediately after RPC-triggered actions) so coalescing
    /// never delays an event by more than one tick.
    pub fn flush_events(&self) {
        let mut staged: Vec<Event> = {
            let mut staged = self.staged.lock().unwrap();
            staged.drain().map(|(_, event)| event).collect()
        };
        staged.sort_by_key(|e| e.timestamp_ms);

        for event in staged {
            {
                let mut events = self.events.lock().unwrap();
                if events.len() >= self.max_events {
                    events.pop_front();
                }
                events.push_back(event.clone());
            }
            // No receivers is a normal, expected state (no MQTT/notification
            // subscriber configured); ignore the error.
            let _ = self.event_tx.send(event);
        }
    }

    /// Samples for `member` with `timestamp_ms >= since`, oldest first.
    pub fn recent_samples(&self, member: &str, since: u64) -> Vec<Sample> {
        let members = self.members.read().unwrap();
        match members.get(member) {
            Some(ring) => {
                let ring = ring.lock().unwrap();
                ring.samples
                    .iter()
                    .filter(|s| s.timestamp_ms >= since)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Most recent `limit` samples for `member`, oldest first (used by the
    /// scorer for `window_avg` and the decision engine for slope fitting).
    pub fn last_n_samples(&self, member: &str, limit: usize) -> Vec<Sample> {
        let members = self.members.read().unwrap();
        match members.get(member) {
            Some(ring) => {
                let ring = ring.lock().unwrap();
                let len = ring.samples.len();
                let start = len.saturating_sub(limit);
                ring.samples.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Newest-first events, capped at `limit`.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        events.iter().rev().take(limit).cloned().collect()
    }

    /// Approximate total memory usage across every ring.
    pub fn memory_usage(&self) -> u64 {
        let members = self.members.read().unwrap();
        let sample_count: usize = members
            .values()
            .map(|r| r.lock().unwrap().samples.len())
            .sum();
        let event_count = self.events.lock().unwrap().len();
        sample_count as u64 * APPROX_BYTES_PER_SAMPLE + event_count as u64 * APPROX_BYTES_PER_EVENT
    }

    /// Downsample every member ring that still has capacity to shed: keep
    /// 1-of-N among samples older than `recent_window_s`, doubling N each
    /// pass, until under the soft cap or no further reduction is possible.
    /// Returns true if a `memory_pressure` event should be raised (rate
    /// limited to one per 60s by the caller, using `should_raise_pressure`).
    pub fn downsample(&self, now_ms: u64, recent_window_s: u64) -> bool {
        let soft_cap = self.max_ram_bytes;
        if self.memory_usage() <= soft_cap {
            return false;
        }

        let recent_window_ms = recent_window_s * 1000;
        let cutoff = now_ms.saturating_sub(recent_window_ms);

        let members = self.members.read().unwrap();
        let mut n = 2usize;
        while self.memory_usage() > soft_cap && n <= 64 {
            for ring in members.values() {
                let mut ring = ring.lock().unwrap();
                let mut kept = VecDeque::with_capacity(ring.samples.len());
                let mut old_index = 0usize;
                for sample in ring.samples.drain(..) {
                    if sample.timestamp_ms >= cutoff {
                        kept.push_back(sample);
                    } else {
                        if old_index % n == 0 {
                            kept.push_back(sample);
                        }
                        old_index += 1;
                    }
                }
                ring.samples = kept;
            }
            n *= 2;
        }

        true
    }

    /// Hard-cap enforcement: if even after downsampling usage is still over
    /// cap, drop the newest sample for `member` instead of storing it.
    pub fn would_exceed_hard_cap(&self, over_margin: f64) -> bool {
        self.memory_usage() as f64 > self.max_ram_bytes as f64 * (1.0 + over_margin)
    }

    /// Rate-limits `memory_pressure` events to at most one per 60s.
    pub fn should_raise_pressure(&self, now_ms: u64) -> bool {
        let mut last = self.last_memory_pressure_ms.lock().unwrap();
        match *last {
            Some(prev) if now_ms.saturating_sub(prev) < 60_000 => false,
            _ => {
                *last = Some(now_ms);
                true
            }
        }
    }

    /// Remove a member's ring entirely (Discovery lost the member across a
    /// full refresh + grace period).
    pub fn forget_member(&self, member: &str) {
        let mut members = self.members.write().unwrap();
        members.remove(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassFields;

    fn sample_at(ts: u64) -> Sample {
        Sample {
            timestamp_ms: ts,
            latency_ms: Some(10.0),
            loss_pct: 0.0,
            jitter_ms: 0.0,
            class_fields: ClassFields::None,
            instant: 0.0,
            ewma: 0.0,
            window_avg: 0.0,
            r#final: 0.0,
            stale: false,
        }
    }

    // ─── Append / ring eviction ──────────────────────────────────────────

    #[test]
    fn append_and_read_back_in_order() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        store.append_sample("wan0", sample_at(100));
        store.append_sample("wan0", sample_at(200));
        store.append_sample("wan0", sample_at(300));

        let samples = store.recent_samples("wan0", 0);
        let timestamps: Vec<u64> = samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let store = TelemetryStore::new(3, 10, 16, 24);
        for ts in [1, 2, 3, 4, 5] {
            store.append_sample("wan0", sample_at(ts));
        }
        let samples = store.recent_samples("wan0", 0);
        let timestamps: Vec<u64> = samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![3, 4, 5]);
    }

    #[test]
    fn samples_are_strictly_monotonic() {
        let store = TelemetryStore::new(100, 100, 16, 24);
        for ts in [10, 20, 30, 40] {
            store.append_sample("wan0", sample_at(ts));
        }
        let samples = store.recent_samples("wan0", 0);
        for w in samples.windows(2) {
            assert!(w[0].timestamp_ms < w[1].timestamp_ms);
        }
    }

    #[test]
    fn unknown_member_returns_empty() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        assert!(store.recent_samples("ghost", 0).is_empty());
    }

    #[test]
    fn last_n_samples_caps_and_keeps_newest() {
        let store = TelemetryStore::new(100, 100, 16, 24);
        for ts in 0..10 {
            store.append_sample("wan0", sample_at(ts));
        }
        let last3 = store.last_n_samples("wan0", 3);
        let timestamps: Vec<u64> = last3.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![7, 8, 9]);
    }

    // ─── Events ──────────────────────────────────────────────────────────

    #[test]
    fn events_are_newest_first_and_capped() {
        let store = TelemetryStore::new(10, 2, 16, 24);
        store.append_event(Event::new(1, EventKind::Discovery, "a").with_from_to(None, Some("wan0".to_string())));
        store.flush_events();
        store.append_event(Event::new(2, EventKind::Discovery, "b").with_from_to(None, Some("wan1".to_string())));
        store.flush_events();
        store.append_event(Event::new(3, EventKind::Discovery, "c").with_from_to(None, Some("wan2".to_string())));
        store.flush_events();

        let events = store.recent_events(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "c");
        assert_eq!(events[1].reason, "b");
    }

    #[test]
    fn events_for_the_same_member_and_kind_coalesce_before_flush() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        store.append_event(
            Event::new(1, EventKind::Discovery, "class_changed").with_from_to(None, Some("wan0".to_string())),
        );
        store.append_event(
            Event::new(2, EventKind::Discovery, "class_changed_again").with_from_to(None, Some("wan0".to_string())),
        );
        store.flush_events();

        let events = store.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "class_changed_again");
    }

    #[test]
    fn memory_pressure_rate_limited_to_once_per_60s() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        assert!(store.should_raise_pressure(1_000));
        assert!(!store.should_raise_pressure(1_500));
        assert!(!store.should_raise_pressure(60_900));
        assert!(store.should_raise_pressure(61_001));
    }

    // ─── Memory / downsampling ───────────────────────────────────────────

    #[test]
    fn memory_usage_grows_with_sample_count() {
        let store = TelemetryStore::new(1000, 1000, 16, 24);
        let before = store.memory_usage();
        for ts in 0..100 {
            store.append_sample("wan0", sample_at(ts));
        }
        assert!(store.memory_usage() > before);
    }

    #[test]
    fn downsample_converges_under_tiny_cap() {
        // max_ram_mb=0 isn't allowed by config validation, but the store
        // itself should still converge given an artificially tiny cap.
        let store = TelemetryStore::new(100_000, 100_000, 0, 24);
        for ts in 0..5000u64 {
            store.append_sample("wan0", sample_at(ts * 1000));
        }
        assert!(store.memory_usage() > 0);
        let raised = store.downsample(5_000_000, 300);
        assert!(raised);
        // Recent window (last 300s = samples from ts>=4_700_000) is kept
        // intact; older samples are thinned, so total should have shrunk.
        assert!(store.memory_usage() < 5000 * APPROX_BYTES_PER_SAMPLE);
    }

    #[test]
    fn downsample_is_noop_under_cap() {
        let store = TelemetryStore::new(100, 100, 16, 24);
        store.append_sample("wan0", sample_at(1000));
        assert!(!store.downsample(2_000, 300));
    }

    #[test]
    fn forget_member_drops_its_ring() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        store.append_sample("wan0", sample_at(1));
        store.forget_member("wan0");
        assert!(store.recent_samples("wan0", 0).is_empty());
    }

    #[test]
    fn subscriber_receives_appended_events() {
        let store = TelemetryStore::new(10, 10, 16, 24);
        let mut rx = store.subscribe_events();
        store.append_event(Event::new(1, EventKind::Switch, "test"));
        store.flush_events();
        let received = rx.try_recv().expect("event should be available");
        assert_eq!(received.reason, "test");
    }
}
