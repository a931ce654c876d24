//! Collectors (C2): one implementation per [`Class`](crate::model::Class),
//! each producing a [`Sample`](crate::model::Sample) every tick.

pub mod cellular;
pub mod common;
pub mod lan;
pub mod satellite;
pub mod wifi;

pub use common::cadence_ms;

use crate::model::{Member, Sample};

/// Owns exactly one concrete collector; the supervisor picks the variant
/// once at Discovery time based on the member's classified [`Class`].
pub enum AnyCollector {
    Satellite(satellite::SatelliteCollector),
    Cellular(cellular::CellularCollector),
    Wifi(wifi::WifiCollector),
    Lan(lan::LanCollector),
}

impl AnyCollector {
    pub async fn collect(&self, member: &Member, now_ms: u64, timeout_ms: u64) -> Sample {
        match self {
            AnyCollector::Satellite(c) => c.collect(member, now_ms, timeout_ms).await,
            AnyCollector::Cellular(c) => c.collect(member, now_ms, timeout_ms).await,
            AnyCollector::Wifi(c) => c.collect(member, now_ms, timeout_ms).await,
            AnyCollector::Lan(c) => c.collect(member, now_ms, timeout_ms).await,
        }
    }

    pub fn forget(&self, member: &str) {
        match self {
            AnyCollector::Satellite(c) => c.forget(member),
            AnyCollector::Cellular(c) => c.forget(member),
            AnyCollector::Wifi(c) => c.forget(member),
            AnyCollector::Lan(c) => c.forget(member),
        }
    }
}
