//! Typed error kinds and their recovery policies.
//!
//! Each variant corresponds to one error kind from the error handling design:
//! the variant alone tells a caller what *kind* of failure occurred; the
//! recovery policy (retry, rollback, fall back, exit) lives in the component
//! that catches it, not here — this type only carries the classification.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StarfailError {
    #[error("config error in {section}.{option}: {detail}")]
    Config {
        section: String,
        option: String,
        detail: String,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("provider transient failure on {provider}: {detail}")]
    ProviderTransient { provider: String, detail: String },

    #[error("controller conflict: {detail}")]
    ControllerConflict { detail: String },

    #[error("memory pressure: usage {usage_bytes} bytes exceeds cap {cap_bytes} bytes")]
    MemoryPressure { usage_bytes: u64, cap_bytes: u64 },

    #[error("action throttled: {kind} rejected, retry after {retry_after_ms}ms")]
    Throttle { kind: String, retry_after_ms: u64 },

    #[error("fatal invariant violation: {detail}")]
    Fatal { detail: String },
}

impl StarfailError {
    /// Stable short name used in log fields and RPC error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            StarfailError::Config { .. } => "config_error",
            StarfailError::ProviderUnavailable { .. } => "provider_unavailable",
            StarfailError::ProviderTransient { .. } => "provider_transient",
            StarfailError::ControllerConflict { .. } => "controller_conflict",
            StarfailError::MemoryPressure { .. } => "memory_pressure",
            StarfailError::Throttle { .. } => "throttle",
            StarfailError::Fatal { .. } => "fatal",
        }
    }

    /// Whether this error should terminate the process (only `Fatal` does;
    /// everything else is handled in place and the tick continues).
    pub fn is_fatal(&self) -> bool {
        matches!(self, StarfailError::Fatal { .. })
    }
}

/// Per-provider exponential backoff for `ProviderTransient` failures:
/// 1s -> 2s -> 4s -> capped at 30s.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            current_ms: 0,
            cap_ms: 30_000,
        }
    }

    /// Advance the backoff after a failure and return the delay to wait.
    pub fn next(&mut self) -> u64 {
        self.current_ms = if self.current_ms == 0 {
            1_000
        } else {
            (self.current_ms * 2).min(self.cap_ms)
        };
        self.current_ms
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.current_ms = 0;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_1_2_4_then_capped() {
        let mut b = Backoff::new();
        assert_eq!(b.next(), 1_000);
        assert_eq!(b.next(), 2_000);
        assert_eq!(b.next(), 4_000);
        assert_eq!(b.next(), 8_000);
        assert_eq!(b.next(), 16_000);
        assert_eq!(b.next(), 30_000);
        assert_eq!(b.next(), 30_000, "must stay capped at 30s");
    }

    #[test]
    fn backoff_reset_returns_to_start() {
        let mut b = Backoff::new();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), 1_000);
    }

    #[test]
    fn fatal_is_the_only_fatal_kind() {
        assert!(StarfailError::Fatal {
            detail: "x".into()
        }
        .is_fatal());
        assert!(!StarfailError::Throttle {
            kind: "failover".into(),
            retry_after_ms: 500
        }
        .is_fatal());
    }
}
