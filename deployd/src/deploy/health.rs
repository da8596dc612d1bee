//! Rollout health polling

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::errors::DeployError;

/// Outcome of a polling window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub satisfied: bool,

    /// Running replicas per role at the last attempt
    pub observed: BTreeMap<String, u32>,

    pub attempts: u32,
}

/// Bounded loop comparing desired against running replicas per role
#[derive(Debug, Clone)]
pub struct HealthPoller {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for HealthPoller {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(5),
        }
    }
}

impl HealthPoller {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// True when every role runs at least its desired replica count
    pub fn is_satisfied(desired: &BTreeMap<String, u32>, observed: &BTreeMap<String, u32>) -> bool {
        desired
            .iter()
            .all(|(role, want)| observed.get(role).copied().unwrap_or(0) >= *want)
    }

    /// Poll until satisfied or the attempts run out. A failed observation
    /// counts as an unsatisfied attempt; this never returns an error.
    pub fn poll<O, S, A>(
        &self,
        desired: &BTreeMap<String, u32>,
        mut observe: O,
        mut sleep: S,
        mut on_attempt: A,
    ) -> HealthReport
    where
        O: FnMut() -> Result<BTreeMap<String, u32>, DeployError>,
        S: FnMut(Duration),
        A: FnMut(u32, &BTreeMap<String, u32>),
    {
        let mut observed = BTreeMap::new();
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            observed = match observe() {
                Ok(counts) => counts,
                Err(e) => {
                    debug!("Health observation {} failed: {}", attempt, e);
                    BTreeMap::new()
                }
            };
            on_attempt(attempt, &observed);

            if Self::is_satisfied(desired, &observed) {
                return HealthReport {
                    satisfied: true,
                    observed,
                    attempts: attempt,
                };
            }
            if attempt < attempts {
                sleep(self.interval);
            }
        }

        HealthReport {
            satisfied: false,
            observed,
            attempts,
        }
    }
}

/// `web 2/3, worker 1/1`
pub fn format_counts(desired: &BTreeMap<String, u32>, observed: &BTreeMap<String, u32>) -> String {
    desired
        .iter()
        .map(|(role, want)| format!("{} {}/{}", role, observed.get(role).copied().unwrap_or(0), want))
        .collect::<Vec<_>>()
        .join(", ")
}
