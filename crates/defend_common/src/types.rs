//! Snapshot types - one polling cycle's view of the managed host
//!
//! A `Snapshot` is captured fresh every cycle and never mutated afterwards.
//! The daemon hands `&Snapshot` to the encoder, the incident detector and the
//! action executor; nothing keeps it past the end of the cycle.

use crate::timeout_policy::TimeoutPolicy;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A request timestamp truncated to the start of its minute
pub type MinuteBucket = DateTime<FixedOffset>;

/// Per-minute request counts for one remote address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTraffic {
    pub address: String,
    pub per_minute: BTreeMap<MinuteBucket, u32>,
}

impl AddressTraffic {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            per_minute: BTreeMap::new(),
        }
    }

    /// Highest count over all observed minute buckets (0 when empty)
    pub fn peak_rate(&self) -> u32 {
        self.per_minute.values().copied().max().unwrap_or(0)
    }
}

/// Requests-per-minute table keyed by remote address.
///
/// Addresses keep the order in which they were first inserted. The encoder
/// derives symbolic ids (`ip0`, `ip1`, ...) from this order, so it must never
/// be re-sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficTable {
    entries: Vec<AddressTraffic>,
}

impl TrafficTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for an address, appending a new one on first sight
    pub fn entry_mut(&mut self, address: &str) -> &mut AddressTraffic {
        let index = match self.entries.iter().position(|e| e.address == address) {
            Some(index) => index,
            None => {
                self.entries.push(AddressTraffic::new(address));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }

    pub fn get(&self, address: &str) -> Option<&AddressTraffic> {
        self.entries.iter().find(|e| e.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressTraffic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the status endpoint told us this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceObservation {
    /// Status page answered within the timeout
    Reachable {
        idle_workers: u32,
        busy_workers: u32,
        cpu_system: f64,
        /// Wall-clock seconds the status request took
        response_time: f64,
    },
    /// Connect or read timed out. `response_time` is a synthetic sentinel
    /// large enough to trip the slow-service check.
    Unreachable { response_time: f64 },
}

impl ServiceObservation {
    pub fn service_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    pub fn response_time(&self) -> f64 {
        match self {
            Self::Reachable { response_time, .. } | Self::Unreachable { response_time } => {
                *response_time
            }
        }
    }

    pub fn idle_workers(&self) -> Option<u32> {
        match self {
            Self::Reachable { idle_workers, .. } => Some(*idle_workers),
            Self::Unreachable { .. } => None,
        }
    }

    pub fn busy_workers(&self) -> Option<u32> {
        match self {
            Self::Reachable { busy_workers, .. } => Some(*busy_workers),
            Self::Unreachable { .. } => None,
        }
    }

    pub fn cpu_system(&self) -> Option<f64> {
        match self {
            Self::Reachable { cpu_system, .. } => Some(*cpu_system),
            Self::Unreachable { .. } => None,
        }
    }

    /// `idle / (idle + busy)`, or `None` when unreachable.
    ///
    /// A server reporting zero workers in total has no idle capacity, so the
    /// ratio is 0.0 rather than NaN.
    pub fn idle_ratio(&self) -> Option<f64> {
        match self {
            Self::Reachable {
                idle_workers,
                busy_workers,
                ..
            } => {
                let total = f64::from(*idle_workers) + f64::from(*busy_workers);
                if total == 0.0 {
                    Some(0.0)
                } else {
                    Some(f64::from(*idle_workers) / total)
                }
            }
            Self::Unreachable { .. } => None,
        }
    }
}

/// Point-in-time observation of traffic, load, firewall and timeout policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub server_name: String,
    pub captured_at: DateTime<Utc>,
    pub traffic: TrafficTable,
    pub service: ServiceObservation,
    /// Addresses that currently have a deny rule
    pub blocked_addresses: BTreeSet<String>,
    pub timeout_policy: TimeoutPolicy,
    pub business_costs: BTreeMap<String, f64>,
}

impl Snapshot {
    pub fn service_unreachable(&self) -> bool {
        self.service.service_unreachable()
    }

    pub fn response_time(&self) -> f64 {
        self.service.response_time()
    }

    pub fn idle_ratio(&self) -> Option<f64> {
        self.service.idle_ratio()
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked_addresses.contains(address)
    }
}
