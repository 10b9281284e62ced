//! Request correlation identifiers.
//!
//! A [`RequestId`] is a caller-chosen opaque token embedded in a request
//! and echoed in its response. Generation is abstracted behind
//! [`RequestIdSource`] so production code can use wall-clock-plus-random
//! ids ([`ClockIdSource`]) while tests swap in a deterministic monotonic
//! counter ([`CounterIdSource`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// An opaque request correlation token.
///
/// Uniqueness among in-flight requests is the generator's responsibility;
/// the channel rejects a duplicate id while a call for it is pending.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing token (e.g. one parsed off the wire).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// Capability for minting fresh request ids.
pub trait RequestIdSource: Send + Sync {
    /// Produce the next id. Must not repeat while a call for a previously
    /// returned id can still be pending.
    fn next(&self) -> RequestId;
}

/// Production id source: Unix millis plus a random hex suffix.
///
/// The suffix guards against two requests minted within the same
/// millisecond.
#[derive(Default)]
pub struct ClockIdSource;

impl RequestIdSource for ClockIdSource {
    fn next(&self) -> RequestId {
        let suffix: u32 = rand::random();
        RequestId(format!("{}-{:08x}", crate::now_millis(), suffix))
    }
}

/// Deterministic id source for tests: `r1`, `r2`, `r3`, ...
#[derive(Default)]
pub struct CounterIdSource {
    counter: AtomicU64,
}

impl CounterIdSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestIdSource for CounterIdSource {
    fn next(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId(format!("r{n}"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_source_unique() {
        let src = ClockIdSource;
        let a = src.next();
        let b = src.next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_counter_source_deterministic() {
        let src = CounterIdSource::new();
        assert_eq!(src.next().as_str(), "r1");
        assert_eq!(src.next().as_str(), "r2");
        assert_eq!(src.next().as_str(), "r3");
    }

    #[test]
    fn test_serde_transparent() {
        let id = RequestId::from_string("r42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"r42\"");
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
