//! Action requests accepted through the local RPC API (C7, `action` method):
//! failover, restore, recheck, set_level, promote. Rate-limited to one
//! accepted call per second per command kind so a misbehaving client can't
//! drive reload storms through the controller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::DataCapMode;
use crate::error::StarfailError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCmd {
    Failover,
    Restore,
    Recheck,
    SetLevel,
    Promote,
}

impl ActionCmd {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCmd::Failover => "failover",
            ActionCmd::Restore => "restore",
            ActionCmd::Recheck => "recheck",
            ActionCmd::SetLevel => "set_level",
            ActionCmd::Promote => "promote",
        }
    }
}

/// The deserialized `{cmd, name?, level?}` body of an `action` RPC call.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub cmd: ActionCmd,
    pub name: Option<String>,
    pub level: Option<DataCapMode>,
}

/// Per-kind token-bucket-of-one: at most one accepted call per second for a
/// given [`ActionCmd`] variant. Shared across RPC handler tasks.
pub struct ActionRateLimiter {
    last_accepted: Mutex<HashMap<ActionCmd, Instant>>,
}

impl ActionRateLimiter {
    pub fn new() -> Self {
        ActionRateLimiter { last_accepted: Mutex::new(HashMap::new()) }
    }

    /// Returns `Ok(())` if this call is accepted, or a `Throttle` error if
    /// the same kind was accepted less than a second ago.
    pub fn check(&self, cmd: ActionCmd) -> Result<(), StarfailError> {
        let mut guard = self.last_accepted.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        if let Some(last) = guard.get(&cmd) {
            let elapsed = now.duration_since(*last);
            if elapsed < Duration::from_secs(1) {
                return Err(StarfailError::Throttle {
                    kind: cmd.as_str().to_string(),
                    retry_after_ms: (Duration::from_secs(1) - elapsed).as_millis() as u64,
                });
            }
        }
        guard.insert(cmd, now);
        Ok(())
    }
}

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_of_a_kind_is_always_accepted() {
        let limiter = ActionRateLimiter::new();
        assert!(limiter.check(ActionCmd::Failover).is_ok());
    }

    #[test]
    fn immediate_repeat_of_the_same_kind_is_throttled() {
        let limiter = ActionRateLimiter::new();
        limiter.check(ActionCmd::Recheck).unwrap();
        let err = limiter.check(ActionCmd::Recheck).unwrap_err();
        assert_eq!(err.kind(), "throttle");
    }

    #[test]
    fn different_kinds_do_not_share_a_bucket() {
        let limiter = ActionRateLimiter::new();
        limiter.check(ActionCmd::Failover).unwrap();
        assert!(limiter.check(ActionCmd::Restore).is_ok());
    }
}
