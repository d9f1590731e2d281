//! The thin client (§4.6): a leader-discovery retry loop. Unlike the
//! Replica, the client carries no notion of term — retries on transport
//! failure can double-apply a payload (§9, client idempotence).

use std::time::Duration;

use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{ClientAppendRequest, ReplicaId};
use crate::transport::Transport;

pub struct Client<P, T> {
    servers: Vec<ReplicaId>,
    leader: Option<ReplicaId>,
    request_timeout: Duration,
    transport: T,
    _payload: std::marker::PhantomData<fn() -> P>,
}

impl<P, T> Client<P, T>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Transport<P>,
{
    pub fn new(servers: Vec<ReplicaId>, request_timeout: Duration, transport: T) -> Self {
        Self {
            servers,
            leader: None,
            request_timeout,
            transport,
            _payload: std::marker::PhantomData,
        }
    }

    /// Blocks until `payload` is known committed. Retries indefinitely.
    pub async fn append_entries(&mut self, payload: P) {
        loop {
            if self.leader.is_none() {
                let pick = rand_pick(&self.servers);
                info!("randomly selected '{pick}' as a leader");
                self.leader = Some(pick);
            }
            let leader = self.leader.clone().expect("leader set above");

            let request = ClientAppendRequest { payload: payload.clone() };
            let result = self
                .transport
                .send_client_append(&leader, request, self.request_timeout)
                .await;

            let mut wait = None;
            match result {
                Some(response) if response.success => {
                    info!("committed append entries request to '{leader}'");
                    return;
                }
                None => {
                    info!("'{leader}' unreachable, retrying");
                    wait = Some(self.request_timeout);
                }
                Some(response) if response.leader.is_none() => {
                    info!("'{leader}' has no leader yet, election likely in progress");
                    self.leader = None;
                    wait = Some(self.request_timeout);
                }
                Some(response) => {
                    info!("'{leader}' redirected to '{:?}'", response.leader);
                    self.leader = response.leader;
                }
            }

            if let Some(delay) = wait {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn rand_pick(servers: &[ReplicaId]) -> ReplicaId {
    use rand::seq::SliceRandom;
    servers
        .choose(&mut rand::thread_rng())
        .expect("at least one server configured")
        .clone()
}
