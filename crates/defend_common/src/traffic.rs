//! Requests-per-minute bucketing

use crate::parsers::AccessLogEntry;
use crate::types::{MinuteBucket, TrafficTable};
use chrono::{DateTime, FixedOffset, Timelike};

/// Truncate a timestamp to the start of its minute
pub fn minute_bucket(timestamp: &DateTime<FixedOffset>) -> MinuteBucket {
    timestamp
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*timestamp)
}

/// Count requests per address per minute.
///
/// Entries are consumed in the order given (the collector passes newest
/// first), and that order fixes the address order of the table. For every
/// request the neighbouring minutes `m-1` and `m+1` (mod 60, same hour) are
/// created with a zero count when absent, which keeps a time series
/// continuous. Zero-filling never lowers an existing count.
pub fn bucket_requests<I>(entries: I) -> TrafficTable
where
    I: IntoIterator<Item = AccessLogEntry>,
{
    let mut table = TrafficTable::new();

    for entry in entries {
        let bucket = minute_bucket(&entry.timestamp);
        let minute = bucket.minute();
        let per_minute = &mut table.entry_mut(&entry.remote_address).per_minute;

        for neighbour in [(minute + 59) % 60, (minute + 1) % 60] {
            if let Some(other) = bucket.with_minute(neighbour) {
                per_minute.entry(other).or_insert(0);
            }
        }
        *per_minute.entry(bucket).or_insert(0) += 1;
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: &str, time: &str) -> AccessLogEntry {
        AccessLogEntry {
            remote_address: address.to_string(),
            timestamp: DateTime::parse_from_rfc3339(time).unwrap(),
        }
    }

    #[test]
    fn test_bucket_counts_and_neighbours() {
        let table = bucket_requests(vec![
            entry("10.0.0.1", "2024-03-01T12:30:05+00:00"),
            entry("10.0.0.1", "2024-03-01T12:30:59+00:00"),
            entry("10.0.0.1", "2024-03-01T12:31:10+00:00"),
        ]);

        let traffic = table.get("10.0.0.1").unwrap();
        let counts: Vec<(u32, u32)> = traffic
            .per_minute
            .iter()
            .map(|(bucket, count)| (bucket.minute(), *count))
            .collect();
        assert_eq!(counts, vec![(29, 0), (30, 2), (31, 1), (32, 0)]);
        assert_eq!(traffic.peak_rate(), 2);
    }

    #[test]
    fn test_zero_fill_never_overwrites_real_count() {
        // 12:31 is counted first, then 12:30 zero-fills 12:31 as its neighbour
        let table = bucket_requests(vec![
            entry("10.0.0.1", "2024-03-01T12:31:00+00:00"),
            entry("10.0.0.1", "2024-03-01T12:31:01+00:00"),
            entry("10.0.0.1", "2024-03-01T12:30:00+00:00"),
        ]);

        let traffic = table.get("10.0.0.1").unwrap();
        let at_31 = minute_bucket(&DateTime::parse_from_rfc3339("2024-03-01T12:31:00+00:00").unwrap());
        assert_eq!(traffic.per_minute[&at_31], 2);
        assert_eq!(traffic.peak_rate(), 2);
    }

    #[test]
    fn test_neighbours_wrap_within_the_hour() {
        let table = bucket_requests(vec![entry("10.0.0.1", "2024-03-01T12:59:30+00:00")]);
        let minutes: Vec<(u32, u32)> = table
            .get("10.0.0.1")
            .unwrap()
            .per_minute
            .keys()
            .map(|b| (b.hour(), b.minute()))
            .collect();
        assert_eq!(minutes, vec![(12, 0), (12, 58), (12, 59)]);
    }

    #[test]
    fn test_addresses_in_first_seen_order() {
        let table = bucket_requests(vec![
            entry("10.0.0.9", "2024-03-01T12:30:00+00:00"),
            entry("10.0.0.1", "2024-03-01T12:30:00+00:00"),
            entry("10.0.0.9", "2024-03-01T12:29:00+00:00"),
        ]);
        let order: Vec<&str> = table.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(order, vec!["10.0.0.9", "10.0.0.1"]);
    }
}
