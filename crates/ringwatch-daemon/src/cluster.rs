//! Cluster file: the static description of a daemon group.
//!
//! ```yaml
//! job: 0
//! daemons:
//!   - 127.0.0.1:7001   # rank 1
//!   - 127.0.0.1:7002   # rank 2
//! app_job: 1
//! hosted:
//!   1: [0, 1]
//!   2: [2, 3]
//! ringwatch:
//!   detector:
//!     heartbeat_period: 0.5
//!     heartbeat_timeout: 1.5
//! ```

use ringwatch_core::{
    ConfigError, GroupInfo, JobId, ProcessId, Rank, RingwatchConfig, StaticLookup,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to read cluster file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cluster file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("cluster file lists no daemons")]
    NoDaemons,

    #[error("rank {rank} is outside the cluster (1..={size})")]
    RankOutOfRange { rank: Rank, size: u32 },

    #[error("hosted processes are listed but app_job is not set")]
    MissingAppJob,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFile {
    /// Job id of the daemon group
    pub job: JobId,
    /// Daemon addresses; the daemon at index `i` has rank `i + 1`
    pub daemons: Vec<SocketAddr>,
    /// Job id of the application processes hosted by the daemons
    #[serde(default)]
    pub app_job: Option<JobId>,
    /// Application ranks hosted by each daemon
    #[serde(default)]
    pub hosted: BTreeMap<Rank, Vec<Rank>>,
    #[serde(default)]
    pub ringwatch: RingwatchConfig,
}

impl ClusterFile {
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClusterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ClusterError> {
        let cluster: Self = serde_yaml::from_str(text)?;
        cluster.validate()?;
        Ok(cluster)
    }

    pub fn to_yaml(&self) -> Result<String, ClusterError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.daemons.is_empty() {
            return Err(ClusterError::NoDaemons);
        }
        if !self.hosted.is_empty() && self.app_job.is_none() {
            return Err(ClusterError::MissingAppJob);
        }
        for &rank in self.hosted.keys() {
            self.check_rank(rank)?;
        }
        self.ringwatch.validate()?;
        Ok(())
    }

    pub fn size(&self) -> u32 {
        self.daemons.len() as u32
    }

    pub fn address(&self, rank: Rank) -> Option<SocketAddr> {
        let index = rank.checked_sub(1)? as usize;
        self.daemons.get(index).copied()
    }

    pub fn group(&self, rank: Rank) -> Result<GroupInfo, ClusterError> {
        self.check_rank(rank)?;
        Ok(GroupInfo::new(self.job, rank, self.size()))
    }

    /// Hosted-process table for failure notifications.
    pub fn lookup(&self) -> StaticLookup {
        let mut lookup = StaticLookup::new();
        if let Some(app_job) = self.app_job {
            for (&daemon, ranks) in &self.hosted {
                let procs = ranks.iter().map(|&r| ProcessId::new(app_job, r)).collect();
                lookup.insert(daemon, procs);
            }
        }
        lookup
    }

    fn check_rank(&self, rank: Rank) -> Result<(), ClusterError> {
        if rank == 0 || rank > self.size() {
            return Err(ClusterError::RankOutOfRange {
                rank,
                size: self.size(),
            });
        }
        Ok(())
    }
}

/// Command-line adjustments layered over the cluster file's settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub heartbeat_period: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub disable_detector: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, base: &RingwatchConfig) -> Result<RingwatchConfig, ConfigError> {
        let mut config = base.clone();
        if let Some(period) = self.heartbeat_period {
            config.detector.heartbeat_period = period;
        }
        if let Some(timeout) = self.heartbeat_timeout {
            config.detector.heartbeat_timeout = timeout;
        }
        if self.disable_detector {
            config.detector.enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}
