//! Parsers for the raw text the collector gathers
//!
//! - `server-status?auto` bodies (flat `Key: Value` block)
//! - access-log lines in Apache combined format
//! - firewall status tables (`ufw status`)

use chrono::{DateTime, FixedOffset};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Token the firewall prints in the action column of a deny rule
pub const DENY_MARKER: &str = "DENY";

static ACCESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(\S+) \S+ \S+ \[([^\]]+)\] "(?:[^"\\]|\\.)*" \d{3} \S+(?: "(?:[^"\\]|\\.)*" "(?:[^"\\]|\\.)*")?$"#,
    )
    .expect("access log regex")
});

const ACCESS_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("status response is missing field '{0}'")]
    MissingStatusField(&'static str),

    #[error("status field '{field}' has invalid value '{value}'")]
    InvalidStatusValue { field: &'static str, value: String },

    #[error("access log line does not match the combined log format: {0}")]
    AccessLine(String),

    #[error("invalid access log timestamp '{0}'")]
    AccessTimestamp(String),
}

/// Worker and CPU figures from the status page
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub idle_workers: u32,
    pub busy_workers: u32,
    pub cpu_system: f64,
    /// Every `Key: Value` pair, including the ones above
    pub fields: BTreeMap<String, String>,
}

/// Parse a `server-status?auto` body.
///
/// The first and last lines are framing and are dropped. Lines without a
/// `": "` separator carry no value and are skipped.
pub fn parse_server_status(body: &str) -> Result<ServerStatus, ParseError> {
    let lines: Vec<&str> = body.split('\n').collect();
    let last = lines.len().saturating_sub(1);

    let mut fields = BTreeMap::new();
    for (line_number, line) in lines.iter().enumerate() {
        if line_number == 0 || line_number == last {
            continue;
        }
        if let Some((key, value)) = line.trim_end_matches('\r').split_once(": ") {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let idle_workers = status_field(&fields, "IdleWorkers")?;
    let busy_workers = status_field(&fields, "BusyWorkers")?;
    let cpu_system = status_field(&fields, "CPUSystem")?;

    Ok(ServerStatus {
        idle_workers,
        busy_workers,
        cpu_system,
        fields,
    })
}

fn status_field<T: std::str::FromStr>(
    fields: &BTreeMap<String, String>,
    name: &'static str,
) -> Result<T, ParseError> {
    let raw = fields.get(name).ok_or(ParseError::MissingStatusField(name))?;
    raw.parse::<T>().map_err(|_| ParseError::InvalidStatusValue {
        field: name,
        value: raw.clone(),
    })
}

/// One request from the access log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub remote_address: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Parse one access-log line (`%h %l %u %t "%r" %>s %b "%{Referer}i" "%{User-agent}i"`)
pub fn parse_access_line(line: &str) -> Result<AccessLogEntry, ParseError> {
    let line = line.trim();
    let caps = ACCESS_LINE
        .captures(line)
        .ok_or_else(|| ParseError::AccessLine(line.to_string()))?;

    let raw_time = &caps[2];
    let timestamp = DateTime::parse_from_str(raw_time, ACCESS_TIME_FORMAT)
        .map_err(|_| ParseError::AccessTimestamp(raw_time.to_string()))?;

    Ok(AccessLogEntry {
        remote_address: caps[1].to_string(),
        timestamp,
    })
}

/// Extract denied addresses from firewall status output.
///
/// A rule line counts only when it has exactly three whitespace-separated
/// tokens and the middle one is the deny marker, e.g. `Anywhere DENY 1.2.3.4`.
pub fn parse_firewall_status(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [_, marker, address] if *marker == DENY_MARKER => Some(address.to_string()),
                _ => None,
            }
        })
        .collect()
}
