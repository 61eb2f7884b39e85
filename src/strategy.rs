//! Backend selection strategies.

use std::fmt;
use std::str::FromStr;

use crate::registry::Backend;

/// Picks one backend from a non-empty snapshot.
///
/// Strategies are stateless with respect to the backend set: all rotation
/// state lives in the request counter handed to [`Strategy::select`].
pub trait Strategy: fmt::Debug + Send + Sync {
    /// Selects a backend for the request numbered `counter`.
    ///
    /// # Panics
    ///
    /// May panic if `backends` is empty; callers must check first.
    fn select<'a>(&self, backends: &'a [Backend], counter: u64) -> &'a Backend;
}

/// Rotates through the backends in snapshot order.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin;

impl Strategy for RoundRobin {
    #[allow(clippy::cast_possible_truncation)]
    fn select<'a>(&self, backends: &'a [Backend], counter: u64) -> &'a Backend {
        // The remainder is below `len`, so it always fits in a usize
        let index = (counter % backends.len() as u64) as usize;
        &backends[index]
    }
}

/// The known strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StrategyKind {
    /// See [`RoundRobin`].
    #[default]
    RoundRobin,
}

impl StrategyKind {
    /// Looks up a strategy by its configured name.
    ///
    /// Unknown names fall back to the default strategy so that a typo in the
    /// configuration does not prevent serving traffic.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|()| {
            let fallback = Self::default();
            tracing::warn!("unknown load balancing method {name:?}, using {fallback}");
            fallback
        })
    }

    /// Canonical name, as reported by the status endpoint.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "RoundRobin",
        }
    }

    /// Builds the strategy implementation.
    #[must_use]
    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "roundrobin" | "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
