//! ProcessId: identifies a daemon or an application process in the runtime.
//!
//! A `(job, rank)` pair. Daemons share one job and hold dense ranks
//! `1..=N`; application processes belong to their own jobs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Job (process group) identifier.
pub type JobId = u32;

/// Position of a process inside its job.
pub type Rank = u32;

#[derive(Debug, Error)]
pub enum ProcessIdError {
    #[error("Invalid process ID format: expected `job.rank` or `[job,rank]`")]
    InvalidFormat,
    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),
}

/// A unique identifier for a process in the runtime.
///
/// Displays as `[job,rank]`. Parses from either that form or the
/// shorter `job.rank` used on the command line.
///
/// # Examples
/// ```
/// use ringwatch_core::ProcessId;
///
/// let proc_id = ProcessId::new(7, 3);
/// assert_eq!(proc_id.to_string(), "[7,3]");
///
/// let parsed: ProcessId = "7.3".parse().unwrap();
/// assert_eq!(parsed, proc_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub job: JobId,
    pub rank: Rank,
}

impl ProcessId {
    pub const fn new(job: JobId, rank: Rank) -> Self {
        Self { job, rank }
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.job, self.rank)
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, rank) = match s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            Some(inner) => inner.split_once(',').ok_or(ProcessIdError::InvalidFormat)?,
            None => s.split_once('.').ok_or(ProcessIdError::InvalidFormat)?,
        };

        Ok(Self {
            job: job.trim().parse()?,
            rank: rank.trim().parse()?,
        })
    }
}

// Serialize as the display string so logs, JSON and bincode frames agree
impl serde::Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
