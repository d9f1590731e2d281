//! Deployment-tunable timing and membership configuration (§5, §10.2).

use std::time::Duration;

use crate::message::ReplicaId;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: ReplicaId,
    /// Addresses of every other replica; excludes self.
    pub peers: Vec<ReplicaId>,
    /// Per-RPC wall-clock bound for client/leader -> peer communication.
    pub request_timeout: Duration,
    /// Lower bound of the randomized election window.
    pub min_voting: Duration,
    /// Upper bound of the randomized election window.
    pub max_voting: Duration,
}

impl RaftConfig {
    /// Source-implied defaults: `REQUEST ~= 1s`, `MIN_VOTING ~= 5s`, `MAX_VOTING ~= 10s`.
    pub fn new(id: impl Into<ReplicaId>, peers: Vec<ReplicaId>) -> Self {
        Self {
            id: id.into(),
            peers,
            request_timeout: Duration::from_secs(1),
            min_voting: Duration::from_secs(5),
            max_voting: Duration::from_secs(10),
        }
    }

    /// `[MIN_VOTING/4, MIN_VOTING/2]`: a floor on heartbeat frequency
    /// strictly smaller than the election window, so heartbeats reliably
    /// refresh `talkedToLeader` before the next election timer fires.
    pub fn heartbeat_interval_range(&self) -> (Duration, Duration) {
        (self.min_voting / 4, self.min_voting / 2)
    }

    /// Per-RPC timeout budgeted across a sequential vote/heartbeat fan-out.
    pub fn per_peer_timeout(&self) -> Duration {
        let n = self.peers.len().max(1) as u32;
        self.min_voting / n
    }
}

/// Loads a newline-delimited peer list, one address per line, matching the
/// original `http_raft.load_servers()` convention. Blank lines are skipped.
pub fn load_peers_file(path: &std::path::Path) -> anyhow::Result<Vec<ReplicaId>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect())
}
