pub mod client;
pub mod config;
pub mod message;
pub mod raft_log;
pub mod replica;
pub mod transport;

pub use client::Client;
pub use config::RaftConfig;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientAppendRequest, ClientAppendResponse,
    RaftMessage, ReplicaId, RequestVoteRequest, RequestVoteResponse,
};
pub use raft_log::{Log, LogEntry};
pub use replica::{Replica, ReplicaState, Role};
pub use transport::{TcpTransport, Transport};
