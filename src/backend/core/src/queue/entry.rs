//! Entry identity and the records stored for it.
//!
//! The Time Index has no value column, so an entry's identity has to be
//! recoverable from the sorted-set member alone. Members are the JSON form of
//! [`EntryKey`]; absent owner/type are `null`, which no real identifier can
//! collide with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QueueError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Externally visible job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Field name used in the payload hash.
    pub(crate) fn field(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(JobId)
            .map_err(|e| QueueError::malformed("job id", s).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry Key
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a scheduled entry: job id plus optional owner and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryKey {
    pub job_id: JobId,
    pub owner: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

impl EntryKey {
    pub fn new(job_id: JobId, owner: Option<String>, job_type: Option<String>) -> Self {
        Self {
            job_id,
            owner,
            job_type,
        }
    }

    /// Encode as a Time Index member.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a Time Index member.
    pub fn decode(member: &str) -> Result<Self> {
        serde_json::from_str(member)
            .map_err(|e| QueueError::malformed("entry key", member).with_source(e))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_id,
            self.owner.as_deref().unwrap_or("-"),
            self.job_type.as_deref().unwrap_or("-")
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Claim Descriptor
// ═══════════════════════════════════════════════════════════════════════════════

/// In-Flight Set record for a claimed, unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimDescriptor {
    pub entry: EntryKey,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub claimed_at: DateTime<Utc>,
    pub tag: Option<String>,
    /// Exact set member this descriptor was stored as.
    #[serde(skip)]
    member: String,
}

impl ClaimDescriptor {
    pub(crate) fn new(entry: EntryKey, claimed_at: DateTime<Utc>, tag: Option<String>) -> Result<Self> {
        let mut descriptor = Self {
            entry,
            claimed_at,
            tag,
            member: String::new(),
        };
        descriptor.member = serde_json::to_string(&descriptor)?;
        Ok(descriptor)
    }

    /// Parse an In-Flight Set member.
    pub fn decode(member: &str) -> Result<Self> {
        let mut descriptor: Self = serde_json::from_str(member)
            .map_err(|e| QueueError::malformed("claim descriptor", member).with_source(e))?;
        descriptor.member = member.to_string();
        Ok(descriptor)
    }

    /// The In-Flight Set member for this descriptor.
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn job_id(&self) -> JobId {
        self.entry.job_id
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// What a consumer handler receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub payload: Vec<u8>,
    pub ready_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scores
// ═══════════════════════════════════════════════════════════════════════════════

/// Time Index score for a ready time (epoch milliseconds).
pub(crate) fn score_of(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Inverse of [`score_of`].
pub(crate) fn time_of(score: f64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(score as i64)
        .ok_or_else(|| QueueError::malformed("ready time score", score.to_string()))
}
