//! Periodic exchange of node capabilities with connected peers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::messages::{self, PROTOCOL_VERSION, PeerMessage, Poll, RequestPoll};
use crate::messenger::Messenger;
use crate::swap::service::Policy;
use crate::swap::unix_now;

/// What a peer last announced about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollInfo {
    pub protocol_version: u64,
    pub supported_assets: Vec<String>,
    /// Whether the peer accepts swaps from this node.
    pub peer_allowed: bool,
    /// Unix seconds.
    pub last_seen: u64,
}

/// Connected peers of the host node.
pub trait PeerSource: Send + Sync {
    fn peers(&self) -> Vec<String>;
}

pub struct PollService {
    messenger: Arc<dyn Messenger>,
    policy: Arc<dyn Policy>,
    assets: Vec<String>,
    polls: Mutex<BTreeMap<String, PollInfo>>,
}

impl PollService {
    pub fn new(messenger: Arc<dyn Messenger>, policy: Arc<dyn Policy>, assets: Vec<String>) -> Self {
        Self {
            messenger,
            policy,
            assets,
            polls: Mutex::new(BTreeMap::new()),
        }
    }

    /// Announces this node's version and assets to `peer_id`.
    pub async fn poll(&self, peer_id: &str) -> Result<()> {
        let message = PeerMessage::Poll(Poll {
            version: PROTOCOL_VERSION,
            supported_assets: self.assets.clone(),
            peer_allowed: self.policy.is_peer_allowed(peer_id),
        });
        self.send(peer_id, &message).await
    }

    pub async fn request_poll(&self, peer_id: &str) -> Result<()> {
        self.send(peer_id, &PeerMessage::RequestPoll(RequestPoll {}))
            .await
    }

    pub async fn poll_peers(&self, peers: &[String]) {
        for peer_id in peers {
            if let Err(err) = self.poll(peer_id).await {
                tracing::debug!(peer_id = %peer_id, error = %err, "poll failed");
            }
        }
    }

    pub async fn handle_message(&self, peer_id: &str, message: &PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Poll(poll) => {
                if poll.version != PROTOCOL_VERSION {
                    tracing::debug!(
                        peer_id = %peer_id,
                        version = poll.version,
                        "poll from incompatible peer"
                    );
                }
                let info = PollInfo {
                    protocol_version: poll.version,
                    supported_assets: poll.supported_assets.clone(),
                    peer_allowed: poll.peer_allowed,
                    last_seen: unix_now(),
                };
                let previous = self
                    .polls
                    .lock()
                    .expect("poll mutex poisoned")
                    .insert(peer_id.to_string(), info.clone());
                if previous.map(|p| (p.protocol_version, p.supported_assets, p.peer_allowed))
                    != Some((info.protocol_version, info.supported_assets, info.peer_allowed))
                {
                    tracing::info!(peer_id = %peer_id, version = poll.version, "peer poll updated");
                }
                Ok(())
            }
            PeerMessage::RequestPoll(_) => self.poll(peer_id).await,
            other => anyhow::bail!("not a poll message: {:?}", other.message_type()),
        }
    }

    pub fn polls(&self) -> BTreeMap<String, PollInfo> {
        self.polls.lock().expect("poll mutex poisoned").clone()
    }

    /// Peers speaking this node's protocol version.
    pub fn compatible_polls(&self) -> BTreeMap<String, PollInfo> {
        self.polls()
            .into_iter()
            .filter(|(_, info)| info.protocol_version == PROTOCOL_VERSION)
            .collect()
    }

    /// Drops peers not heard from since `now - older_than`. Returns how many
    /// were removed.
    pub fn remove_unseen(&self, now: u64, older_than: Duration) -> usize {
        let cutoff = now.saturating_sub(older_than.as_secs());
        let mut polls = self.polls.lock().expect("poll mutex poisoned");
        let before = polls.len();
        polls.retain(|_, info| info.last_seen >= cutoff);
        before - polls.len()
    }

    /// Requests polls from every peer, then polls them every `interval`
    /// until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        peers: Arc<dyn PeerSource>,
        interval: Duration,
        remove_after: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            for peer_id in peers.peers() {
                if let Err(err) = self.request_poll(&peer_id).await {
                    tracing::debug!(peer_id = %peer_id, error = %err, "request poll failed");
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let removed = self.remove_unseen(unix_now(), remove_after);
                if removed > 0 {
                    tracing::debug!(removed, "removed unseen peers");
                }
                self.poll_peers(&peers.peers()).await;
            }
        })
    }

    async fn send(&self, peer_id: &str, message: &PeerMessage) -> Result<()> {
        let (kind, payload) = messages::encode(message)?;
        self.messenger
            .send_message(peer_id, payload, kind.code())
            .await
            .with_context(|| format!("send {kind:?} to {peer_id}"))
    }
}
