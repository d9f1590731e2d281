//! The role state machine: term and vote bookkeeping, the three RPC
//! handlers, and the election / heartbeat drivers (§4.2-§4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use tokio::sync::{Mutex, Notify};

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientAppendResponse, ReplicaId,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::raft_log::Log;
use crate::transport::Transport;
use crate::config::RaftConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
pub struct ReplicaState<P> {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<ReplicaId>,
    pub log: Log<P>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<ReplicaId>,
    pub talked_to_leader: bool,
    pub next_index: HashMap<ReplicaId, u64>,
    pub match_index: HashMap<ReplicaId, u64>,
}

impl<P: Clone> ReplicaState<P> {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            talked_to_leader: false,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }
}

/// Outcome of one `appendEntryToFollower` call (§4.5).
enum SyncOutcome {
    Unreachable,
    NextIndex(u64),
}

pub struct Replica<P, T: Transport<P>> {
    pub id: ReplicaId,
    peers: Vec<ReplicaId>,
    majority: usize,
    config: RaftConfig,
    state: Mutex<ReplicaState<P>>,
    heartbeat_notify: Notify,
    transport: T,
}

impl<P, T> Replica<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Transport<P> + Send + Sync + 'static,
{
    pub fn new(config: RaftConfig, transport: T) -> Self {
        let peers = config.peers.clone();
        // floor((|peers|+1)/2) + 1, counting self.
        let majority = (peers.len() + 1) / 2 + 1;
        Self {
            id: config.id.clone(),
            peers,
            majority,
            config,
            state: Mutex::new(ReplicaState::new()),
            heartbeat_notify: Notify::new(),
            transport,
        }
    }

    /// Spawns the election driver and the heartbeat/sync driver off an
    /// `Arc<Self>`.
    pub fn run(self: &Arc<Self>) {
        let election = Arc::clone(self);
        tokio::spawn(async move {
            election.election_driver().await;
        });

        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            heartbeat.heartbeat_driver().await;
        });
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    pub async fn leader_id(&self) -> Option<ReplicaId> {
        self.state.lock().await.leader_id.clone()
    }

    /// A snapshot accessor for tests that need to inspect log contents.
    pub async fn with_state<R>(&self, f: impl FnOnce(&ReplicaState<P>) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    fn random_duration(lo: Duration, hi: Duration) -> Duration {
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }

    /// Steps down to Follower if `term` is newer than our own. Returns
    /// whether a step-down occurred. Must be called with the state lock held.
    fn check_response_term(&self, state: &mut ReplicaState<P>, term: u64) -> bool {
        if term > state.current_term {
            info!("[{}] observed higher term {term}, stepping down", self.id);
            state.current_term = term;
            state.role = Role::Follower;
            state.leader_id = None;
            true
        } else {
            false
        }
    }

    /// Advances `commit_index` to `index` once a majority (counting self)
    /// has replicated it. `commit_index` never decreases.
    fn try_leader_commit(&self, state: &mut ReplicaState<P>, index: u64) -> bool {
        if state.commit_index >= index {
            return true;
        }
        let mut committed = 1usize; // self
        for &matched in state.match_index.values() {
            if matched >= index {
                committed += 1;
            }
        }
        if committed >= self.majority {
            state.commit_index = index;
            info!("[{}] advanced commit_index to {index}", self.id);
            return true;
        }
        false
    }

    // ---- §4.2 AppendEntries handler ----

    pub async fn handle_append_entries(&self, request: AppendEntriesRequest<P>) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;

        if request.term < state.current_term {
            return AppendEntriesResponse { term: state.current_term, success: false };
        }

        state.role = Role::Follower;
        state.talked_to_leader = true;
        state.leader_id = Some(request.leader_id.clone());
        state.current_term = request.term;
        state.voted_for = None;

        if !state.log.sync_at_item(request.prev_log_index, request.prev_log_term) {
            debug!(
                "[{}] rejecting AppendEntries from {}: log conflict at {}",
                self.id, request.leader_id, request.prev_log_index
            );
            return AppendEntriesResponse { term: state.current_term, success: false };
        }

        if let Some(entry) = request.entry {
            state.log.append_item(request.term, entry);
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(state.log.len());
        }

        AppendEntriesResponse { term: state.current_term, success: true }
    }

    // ---- §4.3 RequestVote handler ----

    pub async fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock().await;

        if request.term < state.current_term {
            return RequestVoteResponse { term: state.current_term, vote_granted: false };
        }

        if let Some(voted_for) = &state.voted_for {
            if voted_for != &request.candidate_id {
                return RequestVoteResponse { term: state.current_term, vote_granted: false };
            }
        }

        // A known deviation from canonical Raft's lexicographic (term, index)
        // up-to-date check: term and length are checked independently (§9).
        let my_last_term = state.log.get_item_term(state.log.len());
        let my_last_index = state.log.len();
        if my_last_term > request.last_log_term || my_last_index > request.last_log_index {
            return RequestVoteResponse { term: state.current_term, vote_granted: false };
        }

        state.voted_for = Some(request.candidate_id.clone());
        info!("[{}] granted vote to {} for term {}", self.id, request.candidate_id, state.current_term);
        RequestVoteResponse { term: state.current_term, vote_granted: true }
    }

    // ---- §4.7 ClientAppend handler ----

    pub async fn handle_client_append(&self, payload: P) -> ClientAppendResponse {
        let (is_leader, leader_id) = {
            let state = self.state.lock().await;
            (state.role == Role::Leader, state.leader_id.clone())
        };
        if !is_leader {
            return ClientAppendResponse { success: false, leader: leader_id };
        }

        let idx = {
            let mut state = self.state.lock().await;
            let idx = state.log.append_item(state.current_term, payload);
            self.try_leader_commit(&mut state, idx);
            idx
        };

        if self.peers.is_empty() {
            let state = self.state.lock().await;
            return ClientAppendResponse {
                success: state.commit_index == idx,
                leader: state.leader_id.clone(),
            };
        }

        let mut peer_index = 0usize;
        loop {
            let peer = self.peers[peer_index % self.peers.len()].clone();
            let outcome = self.append_entry_to_follower(&peer).await;

            let (role, leader_id) = {
                let state = self.state.lock().await;
                (state.role, state.leader_id.clone())
            };
            if role != Role::Leader {
                info!("[{}] lost leadership while appending; redirecting to {leader_id:?}", self.id);
                return ClientAppendResponse { success: false, leader: leader_id };
            }

            match outcome {
                SyncOutcome::Unreachable => {
                    peer_index = peer_index.wrapping_add(1);
                }
                SyncOutcome::NextIndex(next) if next <= idx => {
                    // Peer still catching up; retry the same peer.
                }
                SyncOutcome::NextIndex(_) => {
                    let commit_index = self.state.lock().await.commit_index;
                    if commit_index == idx {
                        info!("[{}] committed entry {idx} on a majority", self.id);
                        return ClientAppendResponse { success: true, leader: leader_id };
                    }
                    peer_index = peer_index.wrapping_add(1);
                }
            }
        }
    }

    // ---- §4.5 heartbeat / sync ----

    async fn append_entry_to_follower(&self, peer: &ReplicaId) -> SyncOutcome {
        let (term, next, prev_index, prev_term, entry, leader_commit) = {
            let state = self.state.lock().await;
            let next = *state.next_index.get(peer).unwrap_or(&(state.log.len() + 1));
            let prev_index = next - 1;
            let prev_term = state.log.get_item_term(prev_index);
            let entry = state.log.get_item(next);
            (state.current_term, next, prev_index, prev_term, entry, state.commit_index)
        };

        let request = AppendEntriesRequest {
            term,
            leader_id: self.id.clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entry: entry.clone(),
            leader_commit,
        };

        let reply = self
            .transport
            .send_append_entries(peer, request, self.config.request_timeout)
            .await;

        let Some(reply) = reply else {
            return SyncOutcome::Unreachable;
        };

        let stepped_down = {
            let mut state = self.state.lock().await;
            self.check_response_term(&mut state, reply.term)
        };
        if stepped_down {
            return SyncOutcome::Unreachable;
        }

        let mut state = self.state.lock().await;
        if !reply.success {
            let current = *state.next_index.get(peer).unwrap_or(&next);
            let decremented = current - 1;
            assert!(decremented > 0, "nextIndex underflowed for {peer}");
            state.next_index.insert(peer.clone(), decremented);
            SyncOutcome::NextIndex(decremented)
        } else {
            if entry.is_some() {
                state.next_index.insert(peer.clone(), next + 1);
                state.match_index.insert(peer.clone(), next);
                self.try_leader_commit(&mut state, next);
            }
            let updated = *state.next_index.get(peer).unwrap_or(&next);
            SyncOutcome::NextIndex(updated)
        }
    }

    async fn heartbeat_driver(&self) {
        loop {
            let is_leader = self.is_leader().await;
            if is_leader {
                for peer in self.peers.clone() {
                    loop {
                        let log_len = self.state.lock().await.log.len();
                        match self.append_entry_to_follower(&peer).await {
                            SyncOutcome::Unreachable => break,
                            SyncOutcome::NextIndex(next) if next > log_len => break,
                            SyncOutcome::NextIndex(_) => continue,
                        }
                    }
                }
                let (lo, hi) = self.config.heartbeat_interval_range();
                let sleep = Self::random_duration(lo, hi);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = self.heartbeat_notify.notified() => {}
                }
            } else {
                self.heartbeat_notify.notified().await;
            }
        }
    }

    // ---- §4.4 election ----

    async fn election_driver(&self) {
        loop {
            let timeout = Self::random_duration(self.config.min_voting, self.config.max_voting);
            tokio::time::sleep(timeout).await;

            let should_start_election = {
                let mut state = self.state.lock().await;
                if state.role == Role::Leader {
                    false
                } else if state.talked_to_leader {
                    state.talked_to_leader = false;
                    false
                } else {
                    true
                }
            };

            if should_start_election {
                info!("[{}] election timeout, starting election", self.id);
                self.start_election().await;
            }
        }
    }

    pub async fn start_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id.clone());
            info!("[{}] starting election for term {}", self.id, state.current_term);
            let last_log_index = state.log.len();
            let last_log_term = state.log.get_item_term(last_log_index);
            (state.current_term, last_log_index, last_log_term)
        };

        let mut votes = 1usize;
        let per_peer_timeout = self.config.per_peer_timeout();

        if votes >= self.majority {
            self.become_leader().await;
            return;
        }

        for peer in &self.peers {
            let request = RequestVoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index,
                last_log_term,
            };

            let Some(reply) = self.transport.send_request_vote(peer, request, per_peer_timeout).await else {
                debug!("[{}] {peer} did not reply to vote request", self.id);
                continue;
            };

            let stepped_down = {
                let mut state = self.state.lock().await;
                self.check_response_term(&mut state, reply.term)
            };
            if stepped_down {
                return;
            }

            if self.state.lock().await.role == Role::Follower {
                info!("[{}] canceling election, became a follower", self.id);
                return;
            }

            if reply.vote_granted {
                votes += 1;
                info!("[{}] received vote from {peer}, total {votes}/{}", self.id, self.majority);
                if votes >= self.majority {
                    self.become_leader().await;
                    return;
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.role == Role::Candidate {
            info!("[{}] election failed, returning to follower", self.id);
            state.role = Role::Follower;
        }
    }

    async fn become_leader(&self) {
        {
            let mut state = self.state.lock().await;
            state.role = Role::Leader;
            state.leader_id = Some(self.id.clone());
            let next = state.log.len() + 1;
            for peer in &self.peers {
                state.next_index.insert(peer.clone(), next);
                state.match_index.insert(peer.clone(), 0);
            }
            info!("[{}] became leader for term {}", self.id, state.current_term);
        }
        self.heartbeat_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport<String> for NullTransport {
        async fn send_append_entries(&self, _: &str, _: AppendEntriesRequest<String>, _: Duration) -> Option<AppendEntriesResponse> {
            None
        }
        async fn send_request_vote(&self, _: &str, _: RequestVoteRequest, _: Duration) -> Option<RequestVoteResponse> {
            None
        }
        async fn send_client_append(&self, _: &str, _: crate::message::ClientAppendRequest<String>, _: Duration) -> Option<ClientAppendResponse> {
            None
        }
    }

    /// A transport whose replies are scripted ahead of time, for driving
    /// `append_entry_to_follower` without real sockets.
    struct ScriptedTransport {
        append_entries_reply: Mutex<Option<AppendEntriesResponse>>,
        request_vote_reply: Mutex<Option<RequestVoteResponse>>,
    }

    impl ScriptedTransport {
        fn append_entries(reply: Option<AppendEntriesResponse>) -> Self {
            Self {
                append_entries_reply: Mutex::new(reply),
                request_vote_reply: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Transport<String> for ScriptedTransport {
        async fn send_append_entries(&self, _: &str, _: AppendEntriesRequest<String>, _: Duration) -> Option<AppendEntriesResponse> {
            self.append_entries_reply.lock().await.clone()
        }
        async fn send_request_vote(&self, _: &str, _: RequestVoteRequest, _: Duration) -> Option<RequestVoteResponse> {
            self.request_vote_reply.lock().await.clone()
        }
        async fn send_client_append(&self, _: &str, _: crate::message::ClientAppendRequest<String>, _: Duration) -> Option<ClientAppendResponse> {
            None
        }
    }

    fn config(id: &str, peers: Vec<&str>) -> RaftConfig {
        RaftConfig::new(id, peers.into_iter().map(String::from).collect())
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_term() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        {
            let mut state = replica.state.lock().await;
            state.current_term = 5;
        }
        let reply = replica
            .handle_append_entries(AppendEntriesRequest {
                term: 4,
                leader_id: "leader".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entry: None,
                leader_commit: 0,
            })
            .await;
        assert_eq!(reply, AppendEntriesResponse { term: 5, success: false });
    }

    #[tokio::test]
    async fn append_entries_accepts_sets_follower_fields_and_appends() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        let reply = replica
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "leader".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entry: Some("hello".to_string()),
                leader_commit: 1,
            })
            .await;
        assert!(reply.success);
        let state = replica.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.leader_id.as_deref(), Some("leader"));
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log.get_item(1), Some("hello".to_string()));
        assert_eq!(state.commit_index, 1);
    }

    #[tokio::test]
    async fn append_entries_commit_index_never_exceeds_log_length() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        let reply = replica
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "leader".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entry: None,
                leader_commit: 99,
            })
            .await;
        assert!(reply.success);
        assert_eq!(replica.commit_index().await, 0);
    }

    #[tokio::test]
    async fn append_entries_conflict_truncates_and_rejects() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        replica
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "leader".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entry: Some("a".to_string()),
                leader_commit: 0,
            })
            .await;
        replica
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "leader".into(),
                prev_log_index: 1,
                prev_log_term: 1,
                entry: Some("b".to_string()),
                leader_commit: 0,
            })
            .await;
        // Conflicting term at index 2 forces a truncation and a rejection.
        let reply = replica
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: "new-leader".into(),
                prev_log_index: 2,
                prev_log_term: 2,
                entry: None,
                leader_commit: 0,
            })
            .await;
        assert!(!reply.success);
        assert_eq!(replica.with_state(|s| s.log.len()).await, 1);
    }

    #[tokio::test]
    async fn request_vote_grants_at_most_once_per_term() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        let first = replica
            .handle_request_vote(RequestVoteRequest {
                term: 1,
                candidate_id: "a".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(first.vote_granted);

        let second = replica
            .handle_request_vote(RequestVoteRequest {
                term: 1,
                candidate_id: "b".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(!second.vote_granted);

        // Re-requesting the same candidate in the same term is still granted.
        let repeat = replica
            .handle_request_vote(RequestVoteRequest {
                term: 1,
                candidate_id: "a".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(repeat.vote_granted);
    }

    #[tokio::test]
    async fn request_vote_rejects_shorter_last_log_index() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        {
            let mut state = replica.state.lock().await;
            state.log.append_item(1, "a".to_string());
            state.log.append_item(1, "b".to_string());
        }
        let reply = replica
            .handle_request_vote(RequestVoteRequest {
                term: 1,
                candidate_id: "a".into(),
                last_log_index: 1,
                last_log_term: 1,
            })
            .await;
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn client_append_redirects_when_not_leader() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        {
            let mut state = replica.state.lock().await;
            state.leader_id = Some("other".to_string());
        }
        let reply = replica.handle_client_append("payload".to_string()).await;
        assert!(!reply.success);
        assert_eq!(reply.leader.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn client_append_commits_immediately_on_single_node_cluster() {
        let replica = Replica::new(config("r1", vec![]), NullTransport);
        {
            let mut state = replica.state.lock().await;
            state.role = Role::Leader;
            state.leader_id = Some("r1".to_string());
        }
        let reply = replica.handle_client_append("payload".to_string()).await;
        assert!(reply.success);
        assert_eq!(replica.commit_index().await, 1);
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_append_entries_reply() {
        let replica = Replica::new(config("r1", vec!["p1"]), ScriptedTransport::append_entries(Some(AppendEntriesResponse {
            term: 9,
            success: false,
        })));
        {
            let mut state = replica.state.lock().await;
            state.role = Role::Leader;
            state.current_term = 1;
            state.next_index.insert("p1".to_string(), 1);
            state.match_index.insert("p1".to_string(), 0);
        }
        let outcome = replica.append_entry_to_follower(&"p1".to_string()).await;
        assert!(matches!(outcome, SyncOutcome::Unreachable));
        let state = replica.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 9);
    }

    #[tokio::test]
    async fn try_leader_commit_requires_majority_including_self() {
        let replica = Replica::new(config("r1", vec!["p1", "p2"]), NullTransport);
        let mut state = replica.state.lock().await;
        state.match_index.insert("p1".to_string(), 0);
        state.match_index.insert("p2".to_string(), 0);
        // Only self at index 3: 1 of 3, not a majority of 2.
        assert!(!replica.try_leader_commit(&mut state, 3));
        state.match_index.insert("p1".to_string(), 3);
        // self + p1 = 2 of 3: majority reached.
        assert!(replica.try_leader_commit(&mut state, 3));
        assert_eq!(state.commit_index, 3);
    }

    #[tokio::test]
    async fn commit_index_never_decreases() {
        let replica = Replica::new(config("r1", vec!["p1"]), NullTransport);
        let mut state = replica.state.lock().await;
        state.match_index.insert("p1".to_string(), 5);
        assert!(replica.try_leader_commit(&mut state, 5));
        assert_eq!(state.commit_index, 5);
        state.match_index.insert("p1".to_string(), 2);
        // Asking to "commit" an older index is a no-op, not a regression.
        assert!(replica.try_leader_commit(&mut state, 2));
        assert_eq!(state.commit_index, 5);
    }
}
