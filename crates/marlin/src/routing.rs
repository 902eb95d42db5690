//! Endpoint selection and health tracking.
//!
//! The router knows nothing about sessions. It keeps, per endpoint, a
//! consecutive-failure counter and an optional blacklist expiry, and answers
//! two questions: "which endpoints, in what order" for sequential scanning,
//! and "which endpoint next" for weighted round-robin.

use marlin_core::Endpoint;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
struct Health {
    failures: u32,
    blacklisted_until: Option<Instant>,
}

impl Health {
    fn is_available(&self, now: Instant) -> bool {
        self.blacklisted_until.is_none_or(|until| until <= now)
    }
}

/// Health-aware endpoint selector.
#[derive(Debug, Clone)]
pub struct Router {
    endpoints: Vec<Endpoint>,
    health: Vec<Health>,
    current_weight: Vec<i64>,
    failure_threshold: u32,
    backoff: Duration,
}

impl Router {
    /// `failure_threshold` is the number of consecutive failures tolerated
    /// before an endpoint is blacklisted for `backoff`.
    pub fn new(endpoints: Vec<Endpoint>, failure_threshold: u32, backoff: Duration) -> Self {
        let n = endpoints.len();
        Self {
            endpoints,
            health: vec![Health::default(); n],
            current_weight: vec![0; n],
            failure_threshold,
            backoff,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn index_of(&self, endpoint: &Endpoint) -> Option<usize> {
        self.endpoints.iter().position(|e| e == endpoint)
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.health
            .get(index)
            .is_some_and(|h| h.is_available(Instant::now()))
    }

    pub fn failures(&self, index: usize) -> u32 {
        self.health.get(index).map_or(0, |h| h.failures)
    }

    /// Count a failure. Returns true when the endpoint is now blacklisted.
    pub fn record_failure(&mut self, index: usize) -> bool {
        let threshold = self.failure_threshold;
        let backoff = self.backoff;
        let Some(health) = self.health.get_mut(index) else {
            return false;
        };
        health.failures = health.failures.saturating_add(1);
        if health.failures > threshold {
            health.blacklisted_until = Some(Instant::now() + backoff);
            warn!(
                endpoint = %self.endpoints[index],
                failures = health.failures,
                backoff = ?backoff,
                "endpoint blacklisted"
            );
            return true;
        }
        false
    }

    /// Clear the failure record after a successful connect.
    pub fn record_success(&mut self, index: usize) {
        if let Some(health) = self.health.get_mut(index) {
            *health = Health::default();
        }
    }

    /// Replace the endpoint list, keeping the health of endpoints that
    /// remain.
    pub fn set_endpoints(&mut self, endpoints: Vec<Endpoint>) {
        let health = endpoints
            .iter()
            .map(|e| {
                self.index_of(e)
                    .map_or_else(Health::default, |i| self.health[i])
            })
            .collect();
        self.current_weight = vec![0; endpoints.len()];
        self.health = health;
        self.endpoints = endpoints;
    }

    /// Endpoints matching `filter`, in scan order from `start` (wrapping).
    ///
    /// Available endpoints come first in order; blacklisted ones follow,
    /// earliest expiry first, so a caller can still try them when nothing
    /// else is left.
    pub fn candidates(&self, start: usize, filter: impl Fn(&Endpoint) -> bool) -> Vec<usize> {
        let n = self.endpoints.len();
        if n == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let (mut available, mut backed_off): (Vec<usize>, Vec<usize>) = (0..n)
            .map(|offset| (start + offset) % n)
            .filter(|&i| filter(&self.endpoints[i]))
            .partition(|&i| self.health[i].is_available(now));
        backed_off.sort_by_key(|&i| self.health[i].blacklisted_until);
        available.extend(backed_off);
        available
    }

    /// Smooth weighted round-robin over available endpoints matching
    /// `filter`.
    ///
    /// Each pick adds every eligible endpoint's weight to its running score,
    /// takes the highest score and subtracts the total weight from it. Equal
    /// weights give plain round-robin. Returns `None` when no matching
    /// endpoint is available.
    pub fn next_weighted(&mut self, filter: impl Fn(&Endpoint) -> bool) -> Option<usize> {
        let now = Instant::now();
        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for i in 0..self.endpoints.len() {
            if !filter(&self.endpoints[i]) || !self.health[i].is_available(now) {
                continue;
            }
            let weight = i64::from(self.endpoints[i].weight.max(1));
            self.current_weight[i] += weight;
            total += weight;
            if best.is_none_or(|b| self.current_weight[i] > self.current_weight[b]) {
                best = Some(i);
            }
        }
        let best = best?;
        self.current_weight[best] -= total;
        debug!(endpoint = %self.endpoints[best], "weighted pick");
        Some(best)
    }
}
