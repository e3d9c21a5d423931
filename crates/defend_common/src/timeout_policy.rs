//! Request-timeout policy (mod_reqtimeout) grammar
//!
//! The policy file carries two clauses:
//!
//! ```text
//! RequestReadTimeout header=20-40,minrate=500
//! RequestReadTimeout body=10,minrate=500
//! ```
//!
//! Parsing is strict: if either clause is missing the file is not in the
//! shape the controller manages and the caller must stop. Rewriting replaces
//! only the `header=...` span, so every other byte of the file survives.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

static HEADER_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*RequestReadTimeout[ \t]+(header=(\d+)-(\d+),((?i:minrate))=(\d+))")
        .expect("header clause regex")
});

static BODY_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*RequestReadTimeout\b[^\n]*?\bbody=(\d+),(?i:minrate)=(\d+)")
        .expect("body clause regex")
});

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("timeout policy has no 'RequestReadTimeout header=<first>-<last>,minrate=<rate>' clause")]
    MissingHeaderClause,

    #[error("timeout policy has no 'RequestReadTimeout body=<first>,minrate=<rate>' clause")]
    MissingBodyClause,

    #[error("timeout policy value out of range: {0}")]
    InvalidNumber(String),
}

/// Header read timeout: initial wait, upper bound, and minimum data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTimeout {
    pub first_byte: u32,
    pub last_byte: u32,
    pub minrate: u32,
}

impl fmt::Display for HeaderTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "header={}-{},minrate={}",
            self.first_byte, self.last_byte, self.minrate
        )
    }
}

/// Body read timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyTimeout {
    pub first_byte: u32,
    pub minrate: u32,
}

impl fmt::Display for BodyTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body={},minrate={}", self.first_byte, self.minrate)
    }
}

/// A named preset (baseline or shortened)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicyValues {
    pub header: HeaderTimeout,
    pub body: BodyTimeout,
}

impl TimeoutPolicyValues {
    /// Apache's stock values
    pub fn baseline() -> Self {
        Self {
            header: HeaderTimeout {
                first_byte: 20,
                last_byte: 40,
                minrate: 500,
            },
            body: BodyTimeout {
                first_byte: 10,
                minrate: 500,
            },
        }
    }

    /// Aggressive header timeout used against slow-header attacks
    pub fn shortened() -> Self {
        Self {
            header: HeaderTimeout {
                first_byte: 4,
                last_byte: 8,
                minrate: 1000,
            },
            body: BodyTimeout {
                first_byte: 10,
                minrate: 500,
            },
        }
    }
}

/// Parsed policy as observed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub header: HeaderTimeout,
    pub body: BodyTimeout,
    /// Header first-byte wait is below the baseline cut-off
    pub shortened: bool,
}

/// Result of asking for a header rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Header clause already holds the target values
    Unchanged,
    Changed { before: HeaderTimeout, text: String },
}

fn parse_number(raw: &str) -> Result<u32, PolicyError> {
    raw.parse::<u32>()
        .map_err(|_| PolicyError::InvalidNumber(raw.to_string()))
}

/// Header clause as found in the text
struct HeaderClause<'a> {
    span: Range<usize>,
    /// `minrate` key as spelled in the file
    rate_key: &'a str,
    values: HeaderTimeout,
}

fn find_header(text: &str) -> Result<HeaderClause<'_>, PolicyError> {
    let caps = HEADER_CLAUSE
        .captures(text)
        .ok_or(PolicyError::MissingHeaderClause)?;
    let span = caps.get(1).ok_or(PolicyError::MissingHeaderClause)?;
    let rate_key = caps.get(4).ok_or(PolicyError::MissingHeaderClause)?;

    Ok(HeaderClause {
        span: span.range(),
        rate_key: rate_key.as_str(),
        values: HeaderTimeout {
            first_byte: parse_number(&caps[2])?,
            last_byte: parse_number(&caps[3])?,
            minrate: parse_number(&caps[5])?,
        },
    })
}

/// Find the header clause. Returns the byte range of `header=...,minrate=N`
/// together with its parsed values.
pub fn locate_header(text: &str) -> Result<(Range<usize>, HeaderTimeout), PolicyError> {
    let clause = find_header(text)?;
    Ok((clause.span, clause.values))
}

fn parse_body(text: &str) -> Result<BodyTimeout, PolicyError> {
    let caps = BODY_CLAUSE
        .captures(text)
        .ok_or(PolicyError::MissingBodyClause)?;

    Ok(BodyTimeout {
        first_byte: parse_number(&caps[1])?,
        minrate: parse_number(&caps[2])?,
    })
}

/// Parse the policy file. `shortened_below` is the header first-byte value
/// under which the policy counts as shortened.
pub fn parse_policy(text: &str, shortened_below: u32) -> Result<TimeoutPolicy, PolicyError> {
    let (_, header) = locate_header(text)?;
    let body = parse_body(text)?;

    Ok(TimeoutPolicy {
        header,
        body,
        shortened: header.first_byte < shortened_below,
    })
}

/// Replace the header clause with `target`, leaving the rest of the text
/// byte-for-byte intact. The `minrate` key keeps the file's spelling.
pub fn rewrite_header(text: &str, target: &HeaderTimeout) -> Result<Rewrite, PolicyError> {
    let clause = find_header(text)?;
    let before = clause.values;
    if before == *target {
        return Ok(Rewrite::Unchanged);
    }

    let mut rewritten = String::with_capacity(text.len() + 8);
    rewritten.push_str(&text[..clause.span.start]);
    rewritten.push_str(&format!(
        "header={}-{},{}={}",
        target.first_byte, target.last_byte, clause.rate_key, target.minrate
    ));
    rewritten.push_str(&text[clause.span.end..]);

    Ok(Rewrite::Changed {
        before,
        text: rewritten,
    })
}
