//! Delivery of custom peer messages through the host Lightning node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Transport offered by the host node: one custom message to one peer.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, peer_id: &str, payload: Vec<u8>, message_type: u16) -> Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessengerError {
    #[error("a redundant sender is already registered for {0}")]
    AlreadyHasSender(String),
}

/// Re-sends one message on a fixed interval until stopped.
///
/// Used for protocol messages whose answer the swap is waiting on; lost or
/// ignored deliveries are simply repeated.
pub struct RedundantSender {
    messenger: Arc<dyn Messenger>,
    peer_id: String,
    payload: Vec<u8>,
    message_type: u16,
    interval: Duration,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RedundantSender {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        peer_id: impl Into<String>,
        payload: Vec<u8>,
        message_type: u16,
        interval: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            messenger,
            peer_id: peer_id.into(),
            payload,
            message_type,
            interval,
            stop_tx,
            task: None,
        }
    }

    /// Sends right away, then once per interval. Send errors are logged and
    /// the next tick tries again. Calling it twice has no effect.
    pub fn send_message_with_retry(&mut self) {
        if self.task.is_some() {
            return;
        }

        let messenger = self.messenger.clone();
        let peer_id = self.peer_id.clone();
        let payload = self.payload.clone();
        let message_type = self.message_type;
        let interval = self.interval;
        let mut stop_rx = self.stop_tx.subscribe();

        self.task = Some(tokio::spawn(async move {
            loop {
                if let Err(err) = messenger
                    .send_message(&peer_id, payload.clone(), message_type)
                    .await
                {
                    tracing::warn!(
                        peer_id = %peer_id,
                        message_type,
                        error = %err,
                        "redundant send failed"
                    );
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for RedundantSender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Running redundant senders keyed by swap id.
#[derive(Default)]
pub struct SenderManager {
    senders: Mutex<HashMap<String, RedundantSender>>,
}

impl SenderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `sender` under `id`. An id already in use keeps its sender.
    pub fn add_sender(&self, id: &str, mut sender: RedundantSender) -> Result<(), MessengerError> {
        let mut senders = self.senders.lock().expect("sender mutex poisoned");
        if senders.contains_key(id) {
            return Err(MessengerError::AlreadyHasSender(id.to_string()));
        }
        sender.send_message_with_retry();
        senders.insert(id.to_string(), sender);
        Ok(())
    }

    /// Stops and drops the sender for `id`. Returns whether one existed.
    pub fn remove_sender(&self, id: &str) -> bool {
        let removed = self
            .senders
            .lock()
            .expect("sender mutex poisoned")
            .remove(id);
        match removed {
            Some(mut sender) => {
                sender.stop();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.senders
            .lock()
            .expect("sender mutex poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.senders.lock().expect("sender mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self
            .senders
            .lock()
            .expect("sender mutex poisoned")
            .drain()
            .collect();
        for (_, mut sender) in drained {
            sender.stop();
        }
    }
}
