//! Backend endpoint selection.

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BalanceStrategy {
    /// Uniform pick among all endpoints.
    #[default]
    Random,
    /// Always pick from the least loaded endpoints.
    Distribute,
}

/// Per-endpoint load, kept both as a counter and as an ordered
/// load -> endpoints index so the minimum bucket is one lookup away.
#[derive(Debug, Default)]
struct LoadState {
    counts: HashMap<String, usize>,
    buckets: BTreeMap<usize, BTreeSet<String>>,
}

impl LoadState {
    fn shift(&mut self, endpoint: &str, from: usize, to: usize) {
        if let Some(bucket) = self.buckets.get_mut(&from) {
            bucket.remove(endpoint);
            if bucket.is_empty() {
                self.buckets.remove(&from);
            }
        }
        self.buckets
            .entry(to)
            .or_default()
            .insert(endpoint.to_string());
        self.counts.insert(endpoint.to_string(), to);
    }

    fn increment(&mut self, endpoint: &str) -> bool {
        let Some(&load) = self.counts.get(endpoint) else {
            return false;
        };
        self.shift(endpoint, load, load + 1);
        true
    }

    fn least_loaded(&self) -> Option<&String> {
        self.buckets
            .first_key_value()
            .and_then(|(_, endpoints)| endpoints.first())
    }
}

#[derive(Debug)]
pub struct Balancer {
    strategy: BalanceStrategy,
    endpoints: Vec<String>,
    state: Mutex<LoadState>,
}

impl Balancer {
    pub fn new(strategy: BalanceStrategy, endpoints: Vec<String>) -> Self {
        let mut state = LoadState::default();
        for endpoint in &endpoints {
            state.counts.insert(endpoint.clone(), 0);
            state.buckets.entry(0).or_default().insert(endpoint.clone());
        }
        Self {
            strategy,
            endpoints,
            state: Mutex::new(state),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Choose an endpoint for a new instance and count it against that
    /// endpoint. Selection and increment happen under one lock, so two
    /// concurrent callers never both see the same minimum.
    pub fn acquire(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let endpoint = match self.strategy {
            BalanceStrategy::Random => self.endpoints.choose(&mut rand::rng()).cloned(),
            BalanceStrategy::Distribute => state.least_loaded().cloned(),
        }?;
        state.increment(&endpoint);
        debug!(endpoint = %endpoint, load = state.counts[&endpoint], "endpoint acquired");
        Some(endpoint)
    }

    /// Count an existing instance against `endpoint` (startup resync).
    pub fn assign(&self, endpoint: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let known = state.increment(endpoint);
        if !known {
            warn!(endpoint = %endpoint, "instance references an unconfigured endpoint");
        }
        known
    }

    pub fn release(&self, endpoint: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.counts.get(endpoint).copied() {
            Some(0) => warn!(endpoint = %endpoint, "released an endpoint with no load"),
            Some(load) => state.shift(endpoint, load, load - 1),
            None => {}
        }
    }

    pub fn loads(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .counts
            .iter()
            .map(|(endpoint, load)| (endpoint.clone(), *load))
            .collect()
    }
}
