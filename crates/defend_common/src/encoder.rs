//! Snapshot → PlanningInstance encoder
//!
//! Pure transformation. Identical input yields an identical instance: ip ids
//! follow the traffic table's first-seen order, predicates are emitted in a
//! fixed rule order, utility values follow the sorted cost table.
//!
//! Rules:
//! 1. one server object, one ip object per traffic address (`ip0`, `ip1`, ...)
//! 2. `HighRate(ip)` when the peak per-minute count reaches the rate threshold
//!    and the address is not exempt
//! 3. `Blocked(ip)` when the address already has a deny rule
//! 4. unreachable service → `ServiceUnreachable` + `ServiceSlow`; otherwise
//!    worker starvation → `ServiceUnreachable`, slow response → `ServiceSlow`
//! 5. `TimeoutShortened` when the header timeout is below baseline
//! 6. one utility value per business cost, name upper-cased

use crate::instance::{IpObject, PlanningInstance, Predicate, ProblemObjects, ServerObject, UtilityValue};
use crate::types::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Incident thresholds, shared by the encoder and the incident detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Requests per minute from one address that count as high
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Idle-worker fraction under which the server counts as starved
    #[serde(default = "default_idle_ratio")]
    pub idle_ratio: f64,

    /// Response time (seconds) above which the service counts as slow
    #[serde(default = "default_slow_response")]
    pub slow_response_secs: f64,
}

fn default_rate() -> u32 {
    120
}

fn default_idle_ratio() -> f64 {
    0.1
}

fn default_slow_response() -> f64 {
    6.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            idle_ratio: default_idle_ratio(),
            slow_response_secs: default_slow_response(),
        }
    }
}

impl Thresholds {
    pub fn is_high_rate(&self, peak_rate: u32) -> bool {
        peak_rate >= self.rate
    }

    /// Strictly below; a ratio equal to the threshold is fine
    pub fn is_starved(&self, idle_ratio: f64) -> bool {
        idle_ratio < self.idle_ratio
    }

    /// Strictly above; a response time equal to the threshold is fine
    pub fn is_slow(&self, response_time: f64) -> bool {
        response_time > self.slow_response_secs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub domain_name: String,
    pub problem_name: String,
    pub thresholds: Thresholds,
    /// Addresses never reported as high-rate
    pub exempt_addresses: BTreeSet<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            domain_name: "website".to_string(),
            problem_name: "p0".to_string(),
            thresholds: Thresholds::default(),
            exempt_addresses: BTreeSet::new(),
        }
    }
}

/// Encode a snapshot as a planning instance
pub fn encode(snapshot: &Snapshot, settings: &EncoderSettings) -> PlanningInstance {
    let server = snapshot.server_name.clone();
    let thresholds = &settings.thresholds;

    let mut ips = Vec::with_capacity(snapshot.traffic.len());
    let mut predicates = Vec::new();

    for (index, traffic) in snapshot.traffic.iter().enumerate() {
        let symbolic_id = format!("ip{}", index);
        let peak_rate = traffic.peak_rate();

        if thresholds.is_high_rate(peak_rate)
            && !settings.exempt_addresses.contains(&traffic.address)
        {
            predicates.push(Predicate::HighRate(symbolic_id.clone()));
        }
        if snapshot.is_blocked(&traffic.address) {
            predicates.push(Predicate::Blocked(symbolic_id.clone()));
        }

        ips.push(IpObject {
            symbolic_id,
            address: traffic.address.clone(),
            peak_rate,
        });
    }

    if snapshot.service_unreachable() {
        predicates.push(Predicate::ServiceUnreachable(server.clone()));
        predicates.push(Predicate::ServiceSlow(server.clone()));
    } else {
        if let Some(ratio) = snapshot.idle_ratio() {
            if thresholds.is_starved(ratio) {
                predicates.push(Predicate::ServiceUnreachable(server.clone()));
            }
        }
        if thresholds.is_slow(snapshot.response_time()) {
            predicates.push(Predicate::ServiceSlow(server.clone()));
        }
    }

    if snapshot.timeout_policy.shortened {
        predicates.push(Predicate::TimeoutShortened(server.clone()));
    }

    let utility_values = snapshot
        .business_costs
        .iter()
        .map(|(name, value)| UtilityValue {
            name: name.to_uppercase(),
            value: *value,
        })
        .collect();

    PlanningInstance {
        domain_name: settings.domain_name.clone(),
        problem_name: settings.problem_name.clone(),
        objects: ProblemObjects {
            servers: vec![ServerObject { name: server }],
            ips,
        },
        predicates,
        utility_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::AccessLogEntry;
    use crate::timeout_policy::{TimeoutPolicy, TimeoutPolicyValues};
    use crate::traffic::bucket_requests;
    use crate::types::{ServiceObservation, TrafficTable};
    use chrono::{DateTime, Duration, Utc};
    use std::collections::BTreeMap;

    fn burst(address: &str, count: u32) -> Vec<AccessLogEntry> {
        let start = DateTime::parse_from_rfc3339("2024-03-01T12:30:00+00:00").unwrap();
        (0..count)
            .map(|i| AccessLogEntry {
                remote_address: address.to_string(),
                timestamp: start + Duration::milliseconds(i64::from(i) * 100),
            })
            .collect()
    }

    fn healthy() -> ServiceObservation {
        ServiceObservation::Reachable {
            idle_workers: 40,
            busy_workers: 10,
            cpu_system: 0.1,
            response_time: 0.2,
        }
    }

    fn snapshot(traffic: TrafficTable, service: ServiceObservation) -> Snapshot {
        let baseline = TimeoutPolicyValues::baseline();
        Snapshot {
            server_name: "apache2".to_string(),
            captured_at: Utc::now(),
            traffic,
            service,
            blocked_addresses: BTreeSet::new(),
            timeout_policy: TimeoutPolicy {
                header: baseline.header,
                body: baseline.body,
                shortened: false,
            },
            business_costs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_single_high_rate_address() {
        let snap = snapshot(bucket_requests(burst("203.0.113.9", 130)), healthy());
        let instance = encode(&snap, &EncoderSettings::default());

        assert_eq!(instance.predicates, vec![Predicate::HighRate("ip0".to_string())]);
        assert_eq!(instance.objects.ips[0].peak_rate, 130);
        assert_eq!(instance.objects.ips[0].address, "203.0.113.9");
    }

    #[test]
    fn test_exempt_address_is_not_high_rate() {
        let snap = snapshot(bucket_requests(burst("203.0.113.9", 130)), healthy());
        let mut settings = EncoderSettings::default();
        settings.exempt_addresses.insert("203.0.113.9".to_string());

        let instance = encode(&snap, &settings);
        assert!(instance.predicates.is_empty());
        assert_eq!(instance.objects.ips.len(), 1);
    }

    #[test]
    fn test_rate_threshold_is_inclusive() {
        let settings = EncoderSettings::default();
        let at = encode(
            &snapshot(bucket_requests(burst("10.0.0.1", 120)), healthy()),
            &settings,
        );
        assert!(at.has_predicate(&Predicate::HighRate("ip0".to_string())));

        let below = encode(
            &snapshot(bucket_requests(burst("10.0.0.1", 119)), healthy()),
            &settings,
        );
        assert!(below.predicates.is_empty());
    }

    #[test]
    fn test_unreachable_implies_unreachable_and_slow_only() {
        let snap = snapshot(
            TrafficTable::new(),
            ServiceObservation::Unreachable { response_time: 100.0 },
        );
        let instance = encode(&snap, &EncoderSettings::default());
        assert_eq!(
            instance.predicates,
            vec![
                Predicate::ServiceUnreachable("apache2".to_string()),
                Predicate::ServiceSlow("apache2".to_string()),
            ]
        );
    }

    #[test]
    fn test_slow_boundary_is_strict() {
        let service = |response_time| ServiceObservation::Reachable {
            idle_workers: 40,
            busy_workers: 10,
            cpu_system: 0.1,
            response_time,
        };
        let settings = EncoderSettings::default();

        let at = encode(&snapshot(TrafficTable::new(), service(6.0)), &settings);
        assert!(at.predicates.is_empty());

        let above = encode(&snapshot(TrafficTable::new(), service(6.01)), &settings);
        assert_eq!(above.predicates, vec![Predicate::ServiceSlow("apache2".to_string())]);
    }

    #[test]
    fn test_idle_boundary_is_strict() {
        let service = |idle, busy| ServiceObservation::Reachable {
            idle_workers: idle,
            busy_workers: busy,
            cpu_system: 0.9,
            response_time: 0.5,
        };
        let settings = EncoderSettings::default();

        // 1 / 10 == 0.1 exactly
        let at = encode(&snapshot(TrafficTable::new(), service(1, 9)), &settings);
        assert!(at.predicates.is_empty());

        let below = encode(&snapshot(TrafficTable::new(), service(1, 19)), &settings);
        assert_eq!(
            below.predicates,
            vec![Predicate::ServiceUnreachable("apache2".to_string())]
        );
    }

    #[test]
    fn test_blocked_and_shortened_predicates() {
        let mut table = bucket_requests(burst("10.0.0.1", 5));
        table.entry_mut("10.0.0.2");
        let mut snap = snapshot(table, healthy());
        snap.blocked_addresses.insert("10.0.0.2".to_string());
        snap.blocked_addresses.insert("192.0.2.1".to_string());
        snap.timeout_policy.shortened = true;

        let instance = encode(&snap, &EncoderSettings::default());
        assert_eq!(
            instance.predicates,
            vec![
                Predicate::Blocked("ip1".to_string()),
                Predicate::TimeoutShortened("apache2".to_string()),
            ]
        );
    }

    #[test]
    fn test_utility_values_upper_cased() {
        let mut snap = snapshot(TrafficTable::new(), healthy());
        snap.business_costs.insert("restart_cost".to_string(), 50.0);
        snap.business_costs.insert("total-cost".to_string(), 0.0);

        let instance = encode(&snap, &EncoderSettings::default());
        let names: Vec<&str> = instance.utility_values.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["RESTART_COST", "TOTAL-COST"]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut entries = burst("10.0.0.3", 150);
        entries.extend(burst("10.0.0.1", 2));
        entries.extend(burst("10.0.0.2", 121));
        let mut snap = snapshot(bucket_requests(entries), healthy());
        snap.blocked_addresses.insert("10.0.0.1".to_string());
        snap.business_costs.insert("sysadmin_cost".to_string(), 1000.0);

        let settings = EncoderSettings::default();
        let first = encode(&snap, &settings);
        let second = encode(&snap, &settings);
        assert_eq!(first, second);

        let ids: Vec<(&str, &str)> = first
            .objects
            .ips
            .iter()
            .map(|ip| (ip.symbolic_id.as_str(), ip.address.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![("ip0", "10.0.0.3"), ("ip1", "10.0.0.1"), ("ip2", "10.0.0.2")]
        );
    }
}
