//! Transport bindings (§6, §10.1): the two function-shaped hooks the core
//! depends on (`sendAppendEntries`, `sendRequestVote`) plus one concrete
//! implementation over length-prefixed JSON on TCP (`write_u32(len)` + bytes,
//! mirrored on read).

use std::marker::PhantomData;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientAppendRequest, ClientAppendResponse,
    RaftMessage, RequestVoteRequest, RequestVoteResponse,
};

/// The only surface the core state machine depends on. `None` stands in for
/// `null`: any connection failure, timeout, or malformed reply.
#[async_trait]
pub trait Transport<P>: Send + Sync {
    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest<P>,
        timeout: Duration,
    ) -> Option<AppendEntriesResponse>;

    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
        timeout: Duration,
    ) -> Option<RequestVoteResponse>;

    async fn send_client_append(
        &self,
        peer: &str,
        request: ClientAppendRequest<P>,
        timeout: Duration,
    ) -> Option<ClientAppendResponse>;
}

/// A concrete `Transport` over raw TCP sockets. One connection per RPC.
pub struct TcpTransport<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> TcpTransport<P> {
    pub fn new() -> Self {
        Self { _payload: PhantomData }
    }
}

impl<P> Default for TcpTransport<P> {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_message<P: Serialize>(stream: &mut TcpStream, message: &RaftMessage<P>) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<P: DeserializeOwned>(stream: &mut TcpStream) -> Result<RaftMessage<P>> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn round_trip<P: Serialize + DeserializeOwned>(
    peer: &str,
    request: RaftMessage<P>,
    deadline: Duration,
) -> Result<RaftMessage<P>> {
    tokio::time::timeout(deadline, async {
        let mut stream = TcpStream::connect(peer).await?;
        write_message(&mut stream, &request).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out contacting {peer}"))?
}

#[async_trait]
impl<P> Transport<P> for TcpTransport<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest<P>,
        timeout: Duration,
    ) -> Option<AppendEntriesResponse> {
        match round_trip(peer, RaftMessage::AppendEntries(request), timeout).await {
            Ok(RaftMessage::AppendEntriesResponse(resp)) => Some(resp),
            Ok(_) => {
                debug!("unexpected reply shape from {peer} to AppendEntries");
                None
            }
            Err(e) => {
                debug!("AppendEntries to {peer} failed: {e}");
                None
            }
        }
    }

    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
        timeout: Duration,
    ) -> Option<RequestVoteResponse> {
        match round_trip(peer, RaftMessage::RequestVote(request), timeout).await {
            Ok(RaftMessage::RequestVoteResponse(resp)) => Some(resp),
            Ok(_) => {
                debug!("unexpected reply shape from {peer} to RequestVote");
                None
            }
            Err(e) => {
                debug!("RequestVote to {peer} failed: {e}");
                None
            }
        }
    }

    async fn send_client_append(
        &self,
        peer: &str,
        request: ClientAppendRequest<P>,
        timeout: Duration,
    ) -> Option<ClientAppendResponse> {
        match round_trip(peer, RaftMessage::ClientAppend(request), timeout).await {
            Ok(RaftMessage::ClientAppendResponse(resp)) => Some(resp),
            Ok(_) => {
                debug!("unexpected reply shape from {peer} to ClientAppend");
                None
            }
            Err(e) => {
                debug!("ClientAppend to {peer} failed: {e}");
                None
            }
        }
    }
}

/// Serves one inbound connection: decode a `RaftMessage`, dispatch to the
/// replica, write back the length-prefixed JSON response. Peer and client
/// RPCs share one socket type since both are multiplexed through the same
/// envelope enum.
pub async fn serve_connection<P, T>(
    mut stream: TcpStream,
    replica: std::sync::Arc<crate::replica::Replica<P, T>>,
) -> Result<()>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    T: Transport<P> + 'static,
{
    let message: RaftMessage<P> = read_message(&mut stream).await?;
    let response = match message {
        RaftMessage::AppendEntries(req) => {
            RaftMessage::AppendEntriesResponse(replica.handle_append_entries(req).await)
        }
        RaftMessage::RequestVote(req) => {
            RaftMessage::RequestVoteResponse(replica.handle_request_vote(req).await)
        }
        RaftMessage::ClientAppend(req) => {
            RaftMessage::ClientAppendResponse(replica.handle_client_append(req.payload).await)
        }
        RaftMessage::AppendEntriesResponse(_)
        | RaftMessage::RequestVoteResponse(_)
        | RaftMessage::ClientAppendResponse(_) => {
            debug!("ignoring response-shaped message received on the listener side");
            return Ok(());
        }
    };
    write_message(&mut stream, &response).await
}
