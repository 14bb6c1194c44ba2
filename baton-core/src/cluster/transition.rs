//! Relinquish/acquire handoff run after membership changes.
//!
//! Each registered datum is re-evaluated in its own task. When the primary
//! moves, the old primary relinquishes and confirms to the new primary over
//! the handoff channel; the new primary acquires once confirmed, or once the
//! timeout runs out, whichever comes first.

use super::Cluster;
use crate::assignment::select_nodes;
use crate::datum::DistDatum;
use crate::error::DatumError;
use crate::messaging::Msg;
use crate::node::Node;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Body of a handoff message: the sender has relinquished `key`.
#[derive(Debug, Serialize, Deserialize)]
struct Relinquished {
    key: String,
}

struct Evaluation {
    key: String,
    datum: Arc<dyn DistDatum>,
    old_primary: Option<Arc<Node>>,
    new_nodes: Vec<Arc<Node>>,
    local: SmolStr,
    handoff: mpsc::Sender<Msg>,
    verbose: bool,
}

enum Outcome {
    Reassigned {
        key: String,
        nodes: Vec<Arc<Node>>,
        awaiting: Option<Arc<dyn DistDatum>>,
    },
    Faulted {
        key: String,
    },
}

/// Runs a user callback. The outer error carries a panic message.
async fn guarded<F>(callback: F) -> Result<Result<(), DatumError>, String>
where
    F: Future<Output = Result<(), DatumError>>,
{
    AssertUnwindSafe(callback).catch_unwind().await.map_err(|panic| {
        panic
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    })
}

async fn acquire(key: &str, datum: &dyn DistDatum) {
    match guarded(datum.acquire()).await {
        Ok(Ok(())) => tracing::info!(key = %key, name = %datum.name(), "acquired"),
        Ok(Err(error)) => tracing::warn!(key = %key, error = %error, "acquire failed"),
        Err(panic) => tracing::error!(key = %key, panic = %panic, "acquire panicked"),
    }
}

impl Evaluation {
    async fn run(self) -> Outcome {
        let key = self.key.clone();
        match AssertUnwindSafe(self.evaluate()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Faulted { key },
        }
    }

    async fn evaluate(self) -> Outcome {
        let new_primary = self.new_nodes.first();
        let new_name = new_primary.map(|node| node.name());
        let old_name = self.old_primary.as_ref().map(|node| node.name());

        let mut awaiting = None;
        if new_name.is_none() || new_name != old_name {
            if self.verbose {
                tracing::info!(key = %self.key, from = ?old_name, to = ?new_name, "datum moving");
            } else {
                tracing::debug!(key = %self.key, from = ?old_name, to = ?new_name, "datum moving");
            }

            if old_name.as_ref() == Some(&self.local) {
                match guarded(self.datum.relinquish()).await {
                    Ok(Ok(())) => {
                        if let Some(new_primary) = new_primary {
                            self.confirm(Arc::clone(new_primary)).await;
                        }
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(key = %self.key, error = %error, "relinquish failed");
                    }
                    Err(panic) => {
                        tracing::error!(key = %self.key, panic = %panic, "relinquish panicked");
                        return Outcome::Faulted { key: self.key };
                    }
                }
            } else if new_name.as_ref() == Some(&self.local) && old_name.is_some() {
                awaiting = Some(Arc::clone(&self.datum));
            }
        }

        Outcome::Reassigned {
            key: self.key,
            nodes: self.new_nodes,
            awaiting,
        }
    }

    async fn confirm(&self, new_primary: Arc<Node>) {
        let msg = match Msg::encode(
            Arc::clone(&new_primary),
            &Relinquished {
                key: self.key.clone(),
            },
        ) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(key = %self.key, error = %error, "failed to encode handoff");
                return;
            }
        };

        if self.handoff.send(msg).await.is_err() {
            tracing::warn!(key = %self.key, "handoff channel closed");
            return;
        }
        tracing::debug!(key = %self.key, to = %new_primary.name(), "sent handoff confirmation");
    }
}

fn confirmed_key(msg: &Msg) -> Option<String> {
    msg.decode::<Relinquished>().ok().map(|body| body.key)
}

impl Cluster {
    /// Recomputes every datum's placement against the current ready nodes
    /// and hands over the datums whose primary moved.
    ///
    /// Holds the coordinator lock throughout, so it never overlaps with
    /// itself or with loading. Once every datum has been evaluated, waits
    /// up to `timeout` for relinquish confirmations; datums still
    /// unconfirmed after that are acquired anyway. Callback failures and panics are logged, never returned.
    pub async fn transition(&self, timeout: Duration) {
        let mut state = self.state.write().await;
        let mut handoff_rx = self.handoff_rx.lock().await;

        let ready = self.ready_nodes().await;
        let local = SmolStr::new(self.membership.local_name());
        let copies = state.copies;

        let mut tasks = JoinSet::new();
        for (key, entry) in &state.entries {
            tasks.spawn(
                Evaluation {
                    key: key.clone(),
                    datum: Arc::clone(&entry.datum),
                    old_primary: entry.nodes.first().cloned(),
                    new_nodes: select_nodes(&ready, entry.datum.id(), copies),
                    local: local.clone(),
                    handoff: self.handoff_tx.clone(),
                    verbose: self.config.verbose_transitions,
                }
                .run(),
            );
        }

        // Confirmations may arrive while evaluations are still running.
        let mut confirmed = HashSet::new();
        let mut pending: HashMap<String, Arc<dyn DistDatum>> = HashMap::new();
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Outcome::Reassigned { key, nodes, awaiting })) => {
                        if let Some(entry) = state.entries.get_mut(&key) {
                            entry.nodes = nodes;
                        }
                        if let Some(datum) = awaiting {
                            pending.insert(key, datum);
                        }
                    }
                    Some(Ok(Outcome::Faulted { key })) => {
                        tracing::error!(key = %key, "datum evaluation panicked, keeping previous assignment");
                    }
                    Some(Err(error)) => {
                        tracing::error!(error = %error, "datum evaluation task failed");
                    }
                },
                Some(msg) = handoff_rx.recv() => {
                    if let Some(key) = confirmed_key(&msg) {
                        confirmed.insert(key);
                    }
                }
            }
        }

        for key in confirmed {
            match pending.remove(&key) {
                Some(datum) => acquire(&key, datum.as_ref()).await,
                None => tracing::debug!(key = %key, "ignoring confirmation for datum not pending"),
            }
        }

        // The wait starts once every evaluation has finished.
        let expired = tokio::time::sleep(timeout);
        tokio::pin!(expired);
        while !pending.is_empty() {
            tokio::select! {
                received = handoff_rx.recv() => {
                    let Some(msg) = received else { break };
                    let Some(key) = confirmed_key(&msg) else { continue };
                    match pending.remove(&key) {
                        Some(datum) => acquire(&key, datum.as_ref()).await,
                        None => tracing::debug!(key = %key, "ignoring confirmation for datum not pending"),
                    }
                }
                _ = &mut expired => {
                    let keys: Vec<&String> = pending.keys().collect();
                    tracing::warn!(
                        pending = ?keys,
                        "timed out waiting for relinquish confirmations, acquiring without them"
                    );
                    for (key, datum) in pending.drain() {
                        acquire(&key, datum.as_ref()).await;
                    }
                }
            }
        }

        tracing::info!(
            node = %local,
            datums = state.entries.len(),
            ready_nodes = ready.len(),
            "transition complete"
        );
    }
}
