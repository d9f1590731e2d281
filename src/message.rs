//! The four RPC message types defined by the external interface: wire-shaped
//! JSON records carried by whatever `Transport` a deployment plugs in.

use serde::{Deserialize, Serialize};

pub type ReplicaId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<P> {
    pub term: u64,
    pub leader_id: ReplicaId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// At most one entry per RPC (§9: batching is a known, unimplemented extension).
    pub entry: Option<P>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: ReplicaId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAppendRequest<P> {
    pub payload: P,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAppendResponse {
    pub success: bool,
    pub leader: Option<ReplicaId>,
}

/// Envelope used by the concrete TCP transport (§10.1) to multiplex all four
/// RPC kinds over a single length-prefixed JSON stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage<P> {
    AppendEntries(AppendEntriesRequest<P>),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    ClientAppend(ClientAppendRequest<P>),
    ClientAppendResponse(ClientAppendResponse),
}
