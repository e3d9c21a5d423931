//! State Collector - assembles one Snapshot per cycle
//!
//! Sources: access log (traffic), status page (workers, CPU, response time),
//! firewall table (blocked addresses), timeout policy file, and the static
//! business-cost table from config.

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::DefendConfig;
use crate::status::{StatusError, StatusSource};
use chrono::Utc;
use defend_common::parsers::{self, ParseError};
use defend_common::timeout_policy::parse_policy;
use defend_common::traffic::bucket_requests;
use defend_common::{PolicyError, ServiceObservation, Snapshot, TimeoutPolicy, TrafficTable};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("failed to read access log {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("access log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("status endpoint: {0}")]
    Status(#[from] StatusError),

    #[error("malformed status page: {0}")]
    StatusBody(#[source] ParseError),

    #[error("firewall status: {0}")]
    Firewall(#[source] CommandError),

    #[error("failed to read timeout policy {path}: {source}")]
    PolicyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout policy {path}: {source}")]
    Policy {
        path: PathBuf,
        #[source]
        source: PolicyError,
    },
}

pub struct StateCollector {
    status: Arc<dyn StatusSource>,
    runner: Arc<dyn CommandRunner>,
    server_name: String,
    log_path: PathBuf,
    log_tail_limit: usize,
    policy_path: PathBuf,
    shortened_below: u32,
    unreachable_response: f64,
    firewall_status: CommandSpec,
    business_costs: BTreeMap<String, f64>,
}

impl StateCollector {
    pub fn new(
        config: &DefendConfig,
        status: Arc<dyn StatusSource>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            status,
            runner,
            server_name: config.monitor.server_name.clone(),
            log_path: config.monitor.log_path.clone(),
            log_tail_limit: config.monitor.log_tail_limit,
            policy_path: config.monitor.policy_path.clone(),
            shortened_below: config.thresholds.shortened_below,
            unreachable_response: config.thresholds.unreachable_response_secs,
            firewall_status: CommandSpec::privileged(
                config.actions.use_sudo,
                &config.actions.firewall_command,
                &["status"],
            ),
            business_costs: config.business.clone(),
        }
    }

    /// Capture a fresh snapshot
    pub async fn collect(&self) -> Result<Snapshot, CollectError> {
        let traffic = self.collect_traffic().await?;
        let service = self.collect_service().await?;
        let blocked_addresses = self.collect_blocked().await?;
        let timeout_policy = self.collect_policy().await?;

        info!(
            "Snapshot: {} addresses, {} blocked, response {:.2}s{}",
            traffic.len(),
            blocked_addresses.len(),
            service.response_time(),
            if service.service_unreachable() {
                " (unreachable)"
            } else {
                ""
            }
        );

        Ok(Snapshot {
            server_name: self.server_name.clone(),
            captured_at: Utc::now(),
            traffic,
            service,
            blocked_addresses,
            timeout_policy,
            business_costs: self.business_costs.clone(),
        })
    }

    async fn collect_traffic(&self) -> Result<TrafficTable, CollectError> {
        let content = read_tail(&self.log_path, self.log_tail_limit, TAIL_CHUNK)
            .await
            .map_err(|source| CollectError::LogRead {
                path: self.log_path.clone(),
                source,
            })?;

        let entries = tail_entries(&content, self.log_tail_limit).map_err(|source| {
            CollectError::Log {
                path: self.log_path.clone(),
                source,
            }
        })?;
        debug!("Parsed {} access log entries", entries.len());

        Ok(bucket_requests(entries))
    }

    async fn collect_service(&self) -> Result<ServiceObservation, CollectError> {
        match self.status.fetch().await {
            Ok(report) => {
                let status =
                    parsers::parse_server_status(&report.body).map_err(CollectError::StatusBody)?;
                Ok(ServiceObservation::Reachable {
                    idle_workers: status.idle_workers,
                    busy_workers: status.busy_workers,
                    cpu_system: status.cpu_system,
                    response_time: report.response_time,
                })
            }
            Err(e) if e.is_degraded() => {
                warn!("Treating service as unreachable: {}", e);
                Ok(ServiceObservation::Unreachable {
                    response_time: self.unreachable_response,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn collect_blocked(&self) -> Result<BTreeSet<String>, CollectError> {
        let output = self
            .runner
            .run(&self.firewall_status, None)
            .await
            .map_err(CollectError::Firewall)?;

        if !output.success() {
            warn!(
                "'{}' exited with status {:?}, assuming no blocked addresses: {}",
                self.firewall_status,
                output.status,
                output.stderr.trim()
            );
            return Ok(BTreeSet::new());
        }

        Ok(parsers::parse_firewall_status(&output.stdout))
    }

    async fn collect_policy(&self) -> Result<TimeoutPolicy, CollectError> {
        read_policy(&self.policy_path, self.shortened_below).await
    }
}

/// Bytes read per backwards step through the access log
const TAIL_CHUNK: u64 = 64 * 1024;

/// Read the end of `path` backwards in `chunk`-sized steps until it holds
/// `limit` complete non-empty lines or the start of the file is reached.
/// A line cut by the window start is dropped.
async fn read_tail(path: &Path, limit: usize, chunk: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut offset = file.metadata().await?.len();
    let mut window: Vec<u8> = Vec::new();

    while offset > 0 {
        let step = chunk.min(offset);
        offset -= step;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut block = vec![0u8; step as usize];
        file.read_exact(&mut block).await?;
        block.extend_from_slice(&window);
        window = block;

        if complete_lines(&window, offset > 0) >= limit {
            break;
        }
    }

    let start = if offset > 0 { first_line_end(&window) } else { 0 };
    Ok(String::from_utf8_lossy(&window[start..]).into_owned())
}

/// Index just past the first newline, or the end when there is none
fn first_line_end(window: &[u8]) -> usize {
    window
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(window.len())
}

fn complete_lines(window: &[u8], cut: bool) -> usize {
    let start = if cut { first_line_end(window) } else { 0 };
    window[start..]
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}

/// The newest `limit` non-empty lines, newest first
fn tail_entries(
    content: &str,
    limit: usize,
) -> Result<Vec<parsers::AccessLogEntry>, ParseError> {
    content
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(limit)
        .map(parsers::parse_access_line)
        .collect()
}

pub(crate) async fn read_policy(
    path: &Path,
    shortened_below: u32,
) -> Result<TimeoutPolicy, CollectError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CollectError::PolicyRead {
            path: path.to_path_buf(),
            source,
        })?;

    parse_policy(&text, shortened_below).map_err(|source| CollectError::Policy {
        path: path.to_path_buf(),
        source,
    })
}
