//! Configurable parameters of a consensus node.

use std::time::Duration;

use crate::error::ConfigError;

const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(3);

/// Configurable parameters of a Raft node.
///
/// Every member of a cluster should be configured with the same election timeout: the heartbeat interval is derived
/// from it, and a leader whose heartbeats are slower than its followers' election timeouts causes spurious elections.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftConfig {
    /// The base interval without leader contact before a follower starts a new election. The effective timeout is
    /// randomized within `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,

    /// The maximum number of log entries shipped to a follower per catch-up round.
    pub catchup_batch_size: usize,

    /// The number of entries a follower may lag behind the leader before it is switched to catch-up shipping.
    pub log_shipping_max_lag: u64,

    /// The size in bytes at which the segmented log rotates to a new segment file.
    pub log_rotation_size: u64,

    /// The maximum number of entries held by the in-flight entry cache.
    pub in_flight_cache_max_entries: usize,

    /// The maximum total content size in bytes held by the in-flight entry cache.
    pub in_flight_cache_max_bytes: usize,

    /// How long a replication attempt waits for a leader to become known.
    pub leader_lookup_timeout: Duration,

    /// How long a replicator waits for a result before retrying against the current leader.
    pub replication_retry_timeout: Duration,

    /// Whether a follower polls the voting members before starting an election. A member which cannot reach a
    /// majority then never raises the term, and cannot depose a working leader when it reconnects.
    pub pre_vote: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(500),
            catchup_batch_size: 64,
            log_shipping_max_lag: 256,
            log_rotation_size: 250 * 1024 * 1024,
            in_flight_cache_max_entries: 1024,
            in_flight_cache_max_bytes: 8 * 1024 * 1024,
            leader_lookup_timeout: Duration::from_secs(10),
            replication_retry_timeout: Duration::from_secs(10),
            pre_vote: false,
        }
    }
}

impl RaftConfig {
    /// The interval between leader heartbeats, always one third of the election timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.election_timeout / 3
    }

    pub fn with_election_timeout(mut self, election_timeout: Duration) -> Self {
        self.election_timeout = election_timeout;
        self
    }

    pub fn with_catchup_batch_size(mut self, catchup_batch_size: usize) -> Self {
        self.catchup_batch_size = catchup_batch_size;
        self
    }

    pub fn with_log_shipping_max_lag(mut self, log_shipping_max_lag: u64) -> Self {
        self.log_shipping_max_lag = log_shipping_max_lag;
        self
    }

    pub fn with_log_rotation_size(mut self, log_rotation_size: u64) -> Self {
        self.log_rotation_size = log_rotation_size;
        self
    }

    pub fn with_in_flight_cache(mut self, max_entries: usize, max_bytes: usize) -> Self {
        self.in_flight_cache_max_entries = max_entries;
        self.in_flight_cache_max_bytes = max_bytes;
        self
    }

    pub fn with_leader_lookup_timeout(mut self, leader_lookup_timeout: Duration) -> Self {
        self.leader_lookup_timeout = leader_lookup_timeout;
        self
    }

    pub fn with_replication_retry_timeout(mut self, replication_retry_timeout: Duration) -> Self {
        self.replication_retry_timeout = replication_retry_timeout;
        self
    }

    pub fn with_pre_vote(mut self, pre_vote: bool) -> Self {
        self.pre_vote = pre_vote;
        self
    }

    /// Checks that the configuration can drive a node.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid parameter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout < MIN_ELECTION_TIMEOUT {
            return Err(ConfigError::ElectionTimeoutTooShort {
                min: MIN_ELECTION_TIMEOUT,
                actual: self.election_timeout,
            });
        }
        if self.catchup_batch_size == 0 {
            return Err(ConfigError::Zero("catchup_batch_size"));
        }
        if self.log_shipping_max_lag == 0 {
            return Err(ConfigError::Zero("log_shipping_max_lag"));
        }
        if self.log_rotation_size == 0 {
            return Err(ConfigError::Zero("log_rotation_size"));
        }
        Ok(())
    }
}
